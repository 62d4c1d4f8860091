//! JPEG stills

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::frame::Frame;
use crate::CaptureError;

/// Write a frame's JPEG payload to `dir/name`
///
/// The image is written to a temporary file first and renamed, so a
/// concurrent reader sees either the previous still or the new one.
pub fn write_snapshot(frame: &Frame, dir: &Path, name: &str) -> Result<PathBuf, CaptureError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(name);
    let tmp = dir.join(format!(".{name}.tmp"));

    let mut file = fs::File::create(&tmp)?;
    file.write_all(&frame.data)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, &path)?;

    debug!(path = %path.display(), bytes = frame.len(), "Snapshot saved");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_written() {
        let dir = tempfile::tempdir().unwrap();
        let frame = Frame::new(vec![0xFFu8, 0xD8, 0xFF, 0xD9], 1, 1, 0, 7);
        let path = write_snapshot(&frame, dir.path(), "overspeed.jpg").unwrap();
        assert_eq!(fs::read(&path).unwrap(), vec![0xFF, 0xD8, 0xFF, 0xD9]);
        assert!(!dir.path().join(".overspeed.jpg.tmp").exists());
    }
}
