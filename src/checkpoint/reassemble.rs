use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::artifact::{atomic_write_bytes, chunk_artifact_name};
use super::plan::sha256_hex;
use super::store::{CheckpointStore, ChunkStatus};
use crate::error::{Result, ScribeError};

/// How `finalize` treats absent or altered chunk artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReassemblyMode {
    /// Log and skip them.
    #[default]
    BestEffort,
    /// Refuse to write a transcript with gaps.
    Strict,
}

/// The combined transcript and what went into it.
#[derive(Debug, Clone)]
pub struct Reassembly {
    pub text: String,
    pub sha256: String,
    pub output_path: PathBuf,
    pub included: Vec<usize>,
    pub missing: Vec<usize>,
}

impl Reassembly {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Join chunk artifacts `0..total_chunks` in index order into `output_path`.
///
/// A chunk is included only when the store records it as `done`; any other
/// index is reported in `missing`.
///
/// Each artifact is trimmed and empty ones are dropped; the rest are joined
/// with `\n`. The result depends only on artifact contents, never on the
/// order chunks were completed in.
pub fn finalize(
    store: &mut CheckpointStore,
    chunk_dir: &Path,
    total_chunks: usize,
    output_path: &Path,
    mode: ReassemblyMode,
) -> Result<Reassembly> {
    let mut parts = Vec::with_capacity(total_chunks);
    let mut included = Vec::with_capacity(total_chunks);
    let mut missing = Vec::new();

    for index in 0..total_chunks {
        let path = chunk_dir.join(chunk_artifact_name(index));

        // Only artifacts the store records as done count; files left over from a
        // reset or replanned run are ignored.
        let expected = match store.chunk(index)? {
            Some(record) if record.status == ChunkStatus::Done => record.artifact_sha256,
            _ => None,
        };
        let Some(expected) = expected else {
            warn!("Chunk {} is not completed, leaving it out", index);
            missing.push(index);
            continue;
        };

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Missing chunk artifact {}", path.display());
                missing.push(index);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if sha256_hex(&bytes) != expected {
            if mode == ReassemblyMode::Strict {
                return Err(ScribeError::Store(format!(
                    "Chunk artifact {} does not match its recorded hash",
                    path.display()
                )));
            }
            warn!(
                "Chunk artifact {} changed since it was recorded",
                path.display()
            );
        }

        let text = String::from_utf8_lossy(&bytes);
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            parts.push(trimmed.to_string());
        }
        included.push(index);
    }

    if mode == ReassemblyMode::Strict && !missing.is_empty() {
        return Err(ScribeError::IncompleteTranscript { missing });
    }

    let combined = parts.join("\n");
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }
    atomic_write_bytes(output_path, combined.as_bytes())?;

    let sha256 = sha256_hex(combined.as_bytes());
    store.persist_final_output(&output_path.display().to_string(), &sha256)?;

    if missing.is_empty() {
        info!("Transcript saved to {}", output_path.display());
    } else {
        warn!(
            "Transcript saved to {} without {} missing chunk(s)",
            output_path.display(),
            missing.len()
        );
    }

    Ok(Reassembly {
        text: combined,
        sha256,
        output_path: output_path.to_path_buf(),
        included,
        missing,
    })
}
