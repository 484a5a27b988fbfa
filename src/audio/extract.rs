use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::error::{Result, ScribeError};

/// Check if FFmpeg is installed and accessible.
pub fn check_ffmpeg() -> Result<()> {
    check_tool("ffmpeg", "FFmpeg not found. Please install FFmpeg and ensure it's in your PATH")
}

/// Check if FFprobe is installed and accessible.
pub fn check_ffprobe() -> Result<()> {
    check_tool("ffprobe", "FFprobe not found. Please install FFmpeg (includes FFprobe)")
}

fn check_tool(name: &str, hint: &str) -> Result<()> {
    let output = Command::new(name)
        .arg("-version")
        .output()
        .map_err(|e| ScribeError::AudioExtraction(format!("{hint}. Error: {e}")))?;

    if !output.status.success() {
        return Err(ScribeError::AudioExtraction(format!("{name} check failed")));
    }

    debug!("{} is available", name);
    Ok(())
}

/// Probe the duration of a media file, in seconds.
pub fn get_audio_duration(input: &Path) -> Result<f64> {
    if !input.exists() {
        return Err(ScribeError::FileNotFound(input.display().to_string()));
    }

    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(input)
        .output()
        .map_err(|e| ScribeError::AudioExtraction(format!("Failed to run FFprobe: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ScribeError::AudioExtraction(format!(
            "FFprobe failed: {stderr}"
        )));
    }

    parse_duration(&String::from_utf8_lossy(&output.stdout))
}

fn parse_duration(raw: &str) -> Result<f64> {
    let duration_secs: f64 = raw.trim().parse().map_err(|e| {
        ScribeError::AudioExtraction(format!("Failed to parse duration '{}': {e}", raw.trim()))
    })?;

    if !duration_secs.is_finite() || duration_secs < 0.0 {
        return Err(ScribeError::AudioExtraction(format!(
            "FFprobe reported an invalid duration: {duration_secs}"
        )));
    }

    Ok(duration_secs)
}

/// Extract `length` seconds of audio starting at `start` into a 16 kHz mono WAV.
///
/// A segment past the end of the media succeeds with an empty file; callers
/// validate the output.
pub async fn extract_audio_segment(
    input: &Path,
    output: &Path,
    start: f64,
    length: f64,
) -> Result<()> {
    if !input.exists() {
        return Err(ScribeError::FileNotFound(input.display().to_string()));
    }

    if length <= 0.0 {
        return Err(ScribeError::AudioExtraction(
            "Segment duration is zero".to_string(),
        ));
    }

    let start_secs = format!("{:.3}", start);
    let duration_secs = format!("{:.3}", length);

    debug!(
        "Extracting segment: start={}, duration={}",
        start_secs, duration_secs
    );

    let status = tokio::process::Command::new("ffmpeg")
        .args(["-y", "-v", "error", "-ss"])
        .arg(&start_secs)
        .args(["-t"])
        .arg(&duration_secs)
        .args(["-i"])
        .arg(input)
        .args(["-vn", "-acodec", "pcm_s16le", "-ar", "16000", "-ac", "1"])
        .arg(output)
        .status()
        .await
        .map_err(|e| ScribeError::AudioExtraction(format!("Failed to run FFmpeg: {e}")))?;

    if !status.success() {
        return Err(ScribeError::AudioExtraction(
            "FFmpeg segment extraction failed".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ffmpeg_available() -> bool {
        Command::new("ffmpeg")
            .arg("-version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("12.5\n").unwrap(), 12.5);
        assert!(parse_duration("N/A").is_err());
        assert!(parse_duration("-3").is_err());
    }

    #[test]
    fn test_duration_file_not_found() {
        let result = get_audio_duration(Path::new("/nonexistent/file.mp4"));
        assert!(matches!(result, Err(ScribeError::FileNotFound(_))));
    }

    #[tokio::test]
    async fn test_extract_segment_rejects_zero_length() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.wav");
        std::fs::write(&input, b"not really audio").unwrap();

        let result = extract_audio_segment(&input, &dir.path().join("out.wav"), 0.0, 0.0).await;
        assert!(matches!(result, Err(ScribeError::AudioExtraction(_))));
    }

    #[test]
    fn test_check_ffmpeg() {
        let result = check_ffmpeg();
        if !ffmpeg_available() {
            eprintln!("Skipping test: FFmpeg not available or broken");
            return;
        }
        assert!(result.is_ok(), "FFmpeg check failed: {:?}", result.err());
    }
}
