use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::plan::sha256_hex;
use crate::error::Result;

/// File name of the transcript artifact for chunk `index`.
pub fn chunk_artifact_name(index: usize) -> String {
    format!("chunk_{:04}.txt", index)
}

/// Durably write a chunk's transcript into `dir`.
///
/// Returns the final path and the SHA-256 of the bytes written. The artifact
/// is on stable storage when this returns, so the caller may then mark the
/// chunk done.
pub fn write_chunk_artifact(dir: &Path, index: usize, text: &str) -> Result<(PathBuf, String)> {
    fs::create_dir_all(dir)?;
    let path = dir.join(chunk_artifact_name(index));
    atomic_write_bytes(&path, text.as_bytes())?;

    let sha = sha256_hex(text.as_bytes());
    debug!("Wrote chunk artifact {} ({})", path.display(), sha);
    Ok((path, sha))
}

/// Write to `<path>.tmp`, fsync, rename over `path`, then fsync the directory.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    sync_parent_dir(path)?;
    Ok(())
}

pub(crate) fn sha256_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    Ok(sha256_hex(&bytes))
}

fn sync_parent_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            let dir = fs::File::open(parent)?;
            dir.sync_all()?;
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
