use std::fs;

use rand::Rng;

use crate::autofunc::Vector;
use crate::errors::{Result, RnnError};
use crate::seq_prop::Sample;

/// Random sequences whose target at time t is the input at time t - `delay`,
/// and zero before that. Inputs are uniform in [-1, 1].
pub fn delayed_echo<R: Rng + ?Sized>(
    rng: &mut R,
    count: usize,
    min_len: usize,
    max_len: usize,
    delay: usize,
) -> Vec<Sample> {
    (0..count)
        .map(|_| {
            let len = rng.random_range(min_len..=max_len);
            let inputs: Vec<Vector> = (0..len)
                .map(|_| Vector::from_elem(1, rng.random_range(-1.0..=1.0)))
                .collect();
            let outputs = (0..len)
                .map(|t| match t.checked_sub(delay) {
                    Some(src) => inputs[src].clone(),
                    None => Vector::zeros(1),
                })
                .collect();
            Sample::new(inputs, outputs)
        })
        .collect()
}

/// Reads samples stored as a JSON array of
/// `{"inputs": [[f64, ..], ..], "outputs": [[f64, ..], ..]}` objects.
pub fn load_samples_json(path: &str) -> Result<Vec<Sample>> {
    let text = fs::read_to_string(path)?;
    let samples: Vec<Sample> = serde_json::from_str(&text).map_err(RnnError::serialization)?;
    if let Some(bad) = samples.iter().position(|s| s.inputs.len() != s.outputs.len()) {
        return Err(RnnError::Deserialization {
            message: format!("sample {} has mismatched input and output lengths", bad),
        });
    }
    Ok(samples)
}

pub fn save_samples_json(samples: &[Sample], path: &str) -> Result<()> {
    let json = serde_json::to_string(samples).map_err(RnnError::serialization)?;
    fs::write(path, json)?;
    Ok(())
}
