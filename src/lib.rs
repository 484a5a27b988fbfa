pub mod audio;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod shutdown;
pub mod storage;
pub mod transcribe;

pub use config::Config;
pub use error::{Result, ScribeError};
pub use pipeline::{
    checkpoint_status, print_status, print_summary, process_claimed_chunks, transcribe_file,
    LoopOutcome, LoopStats, PipelineConfig, RetryPolicy, RunOutcome, RunSummary,
    EXIT_INTERRUPTED,
};
pub use shutdown::{PreemptionPoller, ShutdownCoordinator};
