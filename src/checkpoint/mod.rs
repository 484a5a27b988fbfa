//! Chunk-level checkpointing: planning, the durable store, chunk artifacts
//! and final reassembly.

pub mod artifact;
pub mod plan;
pub mod reassemble;
pub mod store;

pub use artifact::{atomic_write_bytes, chunk_artifact_name, write_chunk_artifact};
pub use plan::{plan_chunks, plan_hash, ChunkSpec, PlanParams};
pub use reassemble::{finalize, Reassembly, ReassemblyMode};
pub use store::{
    CheckpointStore, ChunkRecord, ChunkStatus, ClaimedChunk, FileRecord, Registration,
    StoreOptions, StoreProgress, DEFAULT_BUSY_TIMEOUT,
};

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::warn;

const STORE_DIR: &str = ".checkpoints";
const STORE_FILE: &str = "checkpoint.db";

fn output_parent(output: &Path) -> &Path {
    output.parent().unwrap_or_else(|| Path::new("."))
}

fn output_stem(output: &Path) -> String {
    output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "transcript".to_string())
}

/// Where the store for `output` lives.
///
/// Defaults to `<out_dir>/.checkpoints/<stem>/checkpoint.db`. A relative
/// override resolves against the output directory; remote URIs are not
/// supported as store locations and fall back to the default.
pub fn store_path(output: &Path, override_path: Option<&Path>) -> PathBuf {
    match override_path {
        Some(uri) if uri.to_string_lossy().contains("://") => {
            warn!(
                "Remote checkpoint store location {} is not supported; using local default",
                uri.display()
            );
        }
        Some(path) if path.is_absolute() => return path.to_path_buf(),
        Some(path) => return output_parent(output).join(path),
        None => {}
    }

    output_parent(output)
        .join(STORE_DIR)
        .join(output_stem(output))
        .join(STORE_FILE)
}

/// Directory holding the chunk transcripts for `output`: `<out_dir>/<stem>_chunks`.
pub fn chunk_artifact_dir(output: &Path) -> PathBuf {
    output_parent(output).join(format!("{}_chunks", output_stem(output)))
}

/// Cheap identity for a source file: `<path>:<mtime_ns>:<size>`.
pub fn source_fingerprint(source: &Path) -> String {
    let stat = std::fs::metadata(source).ok().and_then(|meta| {
        let mtime = meta.modified().ok()?.duration_since(UNIX_EPOCH).ok()?;
        Some((mtime.as_nanos(), meta.len()))
    });

    match stat {
        Some((mtime_ns, size)) => format!("{}:{}:{}", source.display(), mtime_ns, size),
        None => format!("{}:unknown", source.display()),
    }
}
