use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::checkpoint::ChunkSpec;
use crate::error::{Result, ScribeError};

use super::extract::extract_audio_segment;
use super::ChunkAudio;

/// File name of the extracted audio for chunk `index`.
pub fn chunk_audio_name(index: usize) -> String {
    format!("chunk_{:04}.wav", index)
}

/// Whether `path` is a readable WAV holding at least one sample.
pub fn is_usable_wav(path: &Path) -> bool {
    match hound::WavReader::open(path) {
        Ok(reader) => reader.duration() > 0,
        Err(e) => {
            debug!("Unreadable chunk audio {}: {}", path.display(), e);
            false
        }
    }
}

/// Extract audio for the `wanted` chunks of `specs` into `output_dir`.
///
/// Best-effort: the first extraction failure stops splitting and the chunks
/// produced so far are returned. Segments that come out empty are discarded.
pub async fn create_chunk_files(
    source: &Path,
    specs: &[ChunkSpec],
    wanted: &BTreeSet<usize>,
    output_dir: &Path,
) -> Result<BTreeMap<usize, ChunkAudio>> {
    if !source.exists() {
        return Err(ScribeError::FileNotFound(source.display().to_string()));
    }

    std::fs::create_dir_all(output_dir).map_err(|e| {
        ScribeError::AudioExtraction(format!("Failed to create output directory: {e}"))
    })?;

    info!(
        "Extracting {} of {} audio chunks into {}",
        wanted.len(),
        specs.len(),
        output_dir.display()
    );

    let mut chunks = BTreeMap::new();

    for spec in specs.iter().filter(|s| wanted.contains(&s.index)) {
        let chunk_path = output_dir.join(chunk_audio_name(spec.index));

        debug!(
            "Creating chunk {}: {:.3}s to {:.3}s",
            spec.index, spec.start_seconds, spec.end_seconds
        );

        if let Err(e) =
            extract_audio_segment(source, &chunk_path, spec.start_seconds, spec.length()).await
        {
            warn!(
                "Failed to extract chunk {}, continuing with {} existing: {}",
                spec.index,
                chunks.len(),
                e
            );
            break;
        }

        if is_usable_wav(&chunk_path) {
            chunks.insert(
                spec.index,
                ChunkAudio {
                    index: spec.index,
                    path: chunk_path,
                },
            );
        } else if chunk_path.exists() {
            warn!("Chunk {} produced no audio, discarding", spec.index);
            let _ = std::fs::remove_file(&chunk_path);
        }
    }

    info!("Created {} audio chunks", chunks.len());
    Ok(chunks)
}
