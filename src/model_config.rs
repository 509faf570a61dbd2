use std::fs;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, RnnError};

/// Shape of a [`DenseBlock`](crate::DenseBlock).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockConfig {
    pub input_size: usize,
    pub state_size: usize,
    pub output_size: usize,
    /// Learn the start state instead of starting from zeros
    #[serde(default)]
    pub trainable_start_state: bool,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            input_size: 1,
            state_size: 8,
            output_size: 1,
            trainable_start_state: true,
        }
    }
}

/// Window sizes for truncated back-propagation through time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BpttConfig {
    /// Timesteps whose outputs contribute gradient in each backward pass
    pub head_size: usize,
    /// Extra timesteps reached through state gradients only
    pub tail_size: usize,
}

impl Default for BpttConfig {
    fn default() -> Self {
        Self {
            head_size: 4,
            tail_size: 4,
        }
    }
}

impl BpttConfig {
    pub fn validate(&self) -> Result<()> {
        if self.head_size == 0 {
            return Err(RnnError::InvalidConfig {
                message: "head_size must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Everything the demo trainer needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub block: BlockConfig,
    pub bptt: BpttConfig,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Sequences are drawn with lengths in `min_seq_len..=max_seq_len`
    pub min_seq_len: usize,
    pub max_seq_len: usize,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            block: BlockConfig::default(),
            bptt: BpttConfig::default(),
            epochs: 200,
            batch_size: 8,
            learning_rate: 0.05,
            min_seq_len: 3,
            max_seq_len: 12,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        self.bptt.validate()?;
        if self.batch_size == 0 {
            return Err(RnnError::InvalidConfig {
                message: "batch_size must be at least 1".to_string(),
            });
        }
        if self.min_seq_len == 0 || self.min_seq_len > self.max_seq_len {
            return Err(RnnError::InvalidConfig {
                message: format!(
                    "invalid sequence length range {}..={}",
                    self.min_seq_len, self.max_seq_len
                ),
            });
        }
        if !(self.learning_rate > 0.0) {
            return Err(RnnError::InvalidConfig {
                message: format!("learning_rate must be positive, got {}", self.learning_rate),
            });
        }
        Ok(())
    }

    /// Loads a JSON config; missing files are an error, not a default.
    pub fn load_json(path: &str) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: TrainingConfig =
            serde_json::from_str(&text).map_err(RnnError::serialization)?;
        config.validate()?;
        Ok(config)
    }
}
