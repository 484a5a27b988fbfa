pub mod chunk;
pub mod extract;

pub use chunk::{chunk_audio_name, create_chunk_files, is_usable_wav};
pub use extract::{check_ffmpeg, check_ffprobe, extract_audio_segment, get_audio_duration};

use std::path::PathBuf;

/// An extracted chunk of source audio, ready for transcription.
#[derive(Debug, Clone)]
pub struct ChunkAudio {
    pub index: usize,
    pub path: PathBuf,
}
