use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, ScribeError};
use crate::transcribe::Transcriber;

/// Local whisper.cpp CLI (`whisper-cli`) run once per chunk.
pub struct WhisperCppEngine {
    binary: String,
    model: String,
    timeout: Duration,
}

impl WhisperCppEngine {
    /// `model` is the path to a ggml model file.
    pub fn new(binary: String, model: String, timeout: Duration) -> Self {
        Self {
            binary,
            model,
            timeout,
        }
    }

    fn build_args(&self, audio: &Path, output_prefix: &Path, language: &str) -> Vec<String> {
        let mut args = vec![
            "-f".to_owned(),
            audio.display().to_string(),
            "-of".to_owned(),
            output_prefix.display().to_string(),
            "-otxt".to_owned(),
            "-nt".to_owned(),
            "-m".to_owned(),
            self.model.clone(),
        ];

        if !language.is_empty() {
            args.push("-l".to_owned());
            args.push(language.to_owned());
        }

        args
    }
}

#[async_trait]
impl Transcriber for WhisperCppEngine {
    async fn transcribe(&self, audio: &Path, language: &str) -> Result<String> {
        if !audio.exists() {
            return Err(ScribeError::FileNotFound(audio.display().to_string()));
        }

        let work_dir = tempfile::tempdir()?;
        let output_prefix = work_dir.path().join("transcript");
        let args = self.build_args(audio, &output_prefix, language);
        debug!("Running {} {:?}", self.binary, args);

        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| {
                ScribeError::EngineTransient(format!(
                    "whisper.cpp timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| ScribeError::Engine(format!("Failed to run {}: {e}", self.binary)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ScribeError::Engine(format!(
                "whisper.cpp exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let txt_path = output_prefix.with_extension("txt");
        let text = tokio::fs::read_to_string(&txt_path).await.map_err(|e| {
            ScribeError::Engine(format!(
                "whisper.cpp produced no transcript at {}: {e}",
                txt_path.display()
            ))
        })?;

        Ok(text.trim().to_string())
    }

    fn name(&self) -> &'static str {
        "whisper.cpp"
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}
