use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Result, ScribeError};

/// Deterministic boundaries for one chunk of work.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSpec {
    pub index: usize,
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub plan_hash: String,
}

impl ChunkSpec {
    pub fn length(&self) -> f64 {
        (self.end_seconds - self.start_seconds).max(0.0)
    }
}

/// Parameters that define what a chunk's work means.
///
/// Changing any of them between runs changes every plan hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanParams {
    pub chunk_seconds: u64,
    pub language: String,
    pub model: String,
}

#[derive(Serialize)]
struct PlanPayload<'a> {
    chunk_seconds: u64,
    language: &'a str,
    model: &'a str,
    index: usize,
    start_seconds: f64,
    end_seconds: f64,
}

/// Split `total_duration` seconds into `ceil(total / chunk_seconds)` fixed chunks.
pub fn plan_chunks(total_duration: f64, params: &PlanParams) -> Result<Vec<ChunkSpec>> {
    if params.chunk_seconds == 0 {
        return Err(ScribeError::Config(
            "Chunk length must be greater than 0 seconds".to_string(),
        ));
    }
    if !total_duration.is_finite() || total_duration <= 0.0 {
        return Ok(Vec::new());
    }

    let chunk_len = params.chunk_seconds as f64;
    let count = (total_duration / chunk_len).ceil() as usize;

    (0..count)
        .map(|index| {
            let start_seconds = index as f64 * chunk_len;
            let end_seconds = total_duration.min((index + 1) as f64 * chunk_len);
            let plan_hash = plan_hash(params, index, start_seconds, end_seconds)?;
            Ok(ChunkSpec {
                index,
                start_seconds,
                end_seconds,
                plan_hash,
            })
        })
        .collect()
}

/// SHA-256 over the sorted-key JSON rendering of the chunk's parameters.
pub fn plan_hash(
    params: &PlanParams,
    index: usize,
    start_seconds: f64,
    end_seconds: f64,
) -> Result<String> {
    let payload = PlanPayload {
        chunk_seconds: params.chunk_seconds,
        language: &params.language,
        model: &params.model,
        index,
        start_seconds,
        end_seconds,
    };
    // Round-trip through Value: its object map is key-sorted.
    let canonical = serde_json::to_string(&serde_json::to_value(&payload)?)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
