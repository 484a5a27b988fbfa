use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScribeError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Checkpoint store is corrupt or unreadable ({0}); rerun with --reset-checkpoint")]
    StoreCorrupt(String),

    #[error("Checkpoint store is locked by another worker: {0}")]
    StoreContention(String),

    #[error("Checkpoint store error: {0}")]
    Store(String),

    #[error("Chunk {0} is not claimed by this worker")]
    ChunkNotClaimed(usize),

    #[error(
        "Chunk plan changed for {} chunk(s) (first: {}); rerun with --reset-checkpoint or --plan-mismatch replan",
        .indices.len(),
        .indices.first().copied().unwrap_or_default()
    )]
    PlanMismatch { indices: Vec<usize> },

    #[error("Chunk audio missing for index {0}")]
    ChunkInputMissing(usize),

    #[error("Transcription engine failed (retryable): {0}")]
    EngineTransient(String),

    #[error("Transcription engine failed: {0}")]
    Engine(String),

    #[error("Transcript incomplete, missing chunks: {missing:?}")]
    IncompleteTranscript { missing: Vec<usize> },

    #[error("Shutdown requested: {0}")]
    ShutdownRequested(String),

    #[error("Audio extraction failed: {0}")]
    AudioExtraction(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ScribeError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ScribeError::StoreContention(_) | ScribeError::EngineTransient(_) => true,
            ScribeError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.is_server_error() || s.as_u16() == 429)
            }
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for ScribeError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                ScribeError::StoreContention(err.to_string())
            }
            Some(ErrorCode::NotADatabase) | Some(ErrorCode::DatabaseCorrupt) => {
                ScribeError::StoreCorrupt(err.to_string())
            }
            _ => ScribeError::Store(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ScribeError>;
