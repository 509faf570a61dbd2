use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;

use crate::errors::{Result, RnnError};
use crate::seq_func::SeqFunc;
use crate::serializer;

/// Current file format version
/// Increment this when making breaking changes to the serialization format
const MODEL_VERSION: u32 = 1;

/// Serialized sequence function with integrity checking
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct VersionedModel {
    /// Format version for backward compatibility
    pub version: u32,
    /// SHA256 checksum of `data` (hex string)
    pub checksum: String,
    /// Typed binary encoding produced by [`SeqFunc::serialize`]
    pub data: Vec<u8>,
    pub metadata: ModelMetadata,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ModelMetadata {
    /// Timestamp when the model was saved (RFC 3339)
    pub saved_at: String,
    /// Value of [`SeqFunc::seq_func_type`] at save time
    pub kind: String,
    /// Total scalar parameter count, if the function reports its parameters
    pub num_parameters: Option<usize>,
    pub description: Option<String>,
}

fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

impl VersionedModel {
    /// Wraps the serialized form of `func`.
    ///
    /// # Errors
    /// Fails if `func` (or any member of it) cannot be serialized.
    pub fn from_seq_func(func: &dyn SeqFunc, description: Option<String>) -> Result<Self> {
        let data = func.serialize()?;
        let num_parameters = func
            .parameters()
            .ok()
            .map(|params| params.iter().map(|p| p.len()).sum::<usize>());

        let metadata = ModelMetadata {
            saved_at: chrono::Utc::now().to_rfc3339(),
            kind: func.seq_func_type().to_string(),
            num_parameters,
            description,
        };

        Ok(VersionedModel {
            version: MODEL_VERSION,
            checksum: checksum(&data),
            data,
            metadata,
        })
    }

    pub fn validate_checksum(&self) -> Result<()> {
        let computed = checksum(&self.data);
        if computed != self.checksum {
            return Err(RnnError::ChecksumMismatch {
                expected: self.checksum.clone(),
                computed,
            });
        }
        Ok(())
    }

    pub fn validate_version(&self) -> Result<()> {
        if self.version > MODEL_VERSION {
            return Err(RnnError::UnsupportedVersion {
                version: self.version,
                supported: MODEL_VERSION,
            });
        }

        if self.version < MODEL_VERSION {
            tracing::warn!(
                "Loading model with older version {} (current: {})",
                self.version,
                MODEL_VERSION
            );
        }

        Ok(())
    }

    /// Validates the container and decodes the sequence function.
    pub fn to_seq_func(&self) -> Result<Box<dyn SeqFunc>> {
        self.validate_version()?;
        self.validate_checksum()?;
        serializer::deserialize_with_type(&self.data)?.into_seq_func()
    }

    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(RnnError::serialization)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load_from_file(path: &str) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(RnnError::serialization)
    }
}

/// Saves `func` to `path` with versioning and a checksum.
pub fn save_seq_func(func: &dyn SeqFunc, path: &str, description: Option<String>) -> Result<()> {
    let versioned = VersionedModel::from_seq_func(func, description)?;
    versioned.save_to_file(path)?;

    tracing::info!(
        path = path,
        version = MODEL_VERSION,
        checksum = &versioned.checksum[..16],
        kind = versioned.metadata.kind.as_str(),
        "Model saved with versioning and integrity check"
    );
    Ok(())
}

pub fn load_seq_func(path: &str) -> Result<Box<dyn SeqFunc>> {
    let versioned = VersionedModel::load_from_file(path)?;

    tracing::info!(
        path = path,
        version = versioned.version,
        saved_at = versioned.metadata.saved_at.as_str(),
        kind = versioned.metadata.kind.as_str(),
        "Loading versioned model"
    );

    versioned.to_seq_func()
}
