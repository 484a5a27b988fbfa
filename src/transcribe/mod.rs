pub mod whisper;
pub mod whisper_cpp;

pub use whisper::WhisperClient;
pub use whisper_cpp::WhisperCppEngine;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{Config, Provider};
use crate::error::{Result, ScribeError};

/// A speech-to-text engine: one audio file in, its text out.
///
/// Implementations do not retry. A failure that may succeed later is
/// reported as `ScribeError::EngineTransient`, anything else as
/// `ScribeError::Engine`; the caller owns the retry policy.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &Path, language: &str) -> Result<String>;
    fn name(&self) -> &'static str;
    /// Identifier of the model doing the work, as bound into chunk plan hashes.
    fn model_id(&self) -> &str;
}

/// Build the engine selected by `config.provider`.
pub fn create_transcriber(config: &Config) -> Result<Box<dyn Transcriber>> {
    match config.provider {
        Provider::Openai => {
            let api_key = config.openai_api_key.clone().ok_or_else(|| {
                ScribeError::Config("OPENAI_API_KEY is required for the openai provider".into())
            })?;
            Ok(Box::new(
                WhisperClient::new(api_key).with_model(config.model.clone()),
            ))
        }
        Provider::WhisperCpp => Ok(Box::new(WhisperCppEngine::new(
            config.whisper_cpp_binary.clone(),
            config.model.clone(),
            Duration::from_secs(config.engine_timeout_secs),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_requires_key() {
        let config = Config::default();
        assert!(matches!(
            create_transcriber(&config),
            Err(ScribeError::Config(_))
        ));
    }

    #[test]
    fn test_selects_provider() {
        let config = Config {
            openai_api_key: Some("sk-test".into()),
            ..Config::default()
        };
        let engine = create_transcriber(&config).unwrap();
        assert_eq!(engine.name(), "OpenAI Whisper");
        assert_eq!(engine.model_id(), "whisper-1");

        let config = Config {
            provider: Provider::WhisperCpp,
            model: "models/ggml-base.en.bin".into(),
            ..Config::default()
        };
        let engine = create_transcriber(&config).unwrap();
        assert_eq!(engine.name(), "whisper.cpp");
        assert_eq!(engine.model_id(), "models/ggml-base.en.bin");
    }
}
