//! Motion-JPEG AVI container writer
//!
//! Frames are appended as `00dc` chunks inside the `movi` list. The header
//! is written with placeholder sizes up front and rewritten with the final
//! counts in [`MjpegAviWriter::finish`], followed by an `idx1` index. Output
//! goes to `<path>.part` and is renamed into place once complete, so readers
//! never observe a half-written file under the final name.

use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::frame::Frame;
use crate::CaptureError;

/// Size of the fixed RIFF/hdrl header including the `movi` list header
const HEADER_LEN: u64 = 224;

/// Absolute offset of the `movi` fourcc; index offsets are relative to it
const MOVI_FOURCC_POS: u64 = 220;

/// `AVIF_HASINDEX`
const AVIF_HASINDEX: u32 = 0x10;

/// `AVIIF_KEYFRAME`
const AVIIF_KEYFRAME: u32 = 0x10;

struct IndexEntry {
    offset: u32,
    size: u32,
}

/// Streaming MJPEG AVI writer
pub struct MjpegAviWriter {
    file: BufWriter<File>,
    part_path: PathBuf,
    final_path: PathBuf,
    width: u32,
    height: u32,
    fps: u32,
    position: u64,
    index: Vec<IndexEntry>,
    max_frame: u32,
}

impl MjpegAviWriter {
    /// Create a writer for `path`; the file appears under that name on finish
    pub fn create(path: impl AsRef<Path>, width: u32, height: u32, fps: u32) -> Result<Self, CaptureError> {
        let final_path = path.as_ref().to_path_buf();
        let part_path = part_path(&final_path);

        if let Some(parent) = final_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = BufWriter::new(File::create(&part_path)?);
        file.write_all(&build_header(width, height, fps.max(1), 0, 0, 4, 0))?;

        debug!(path = %final_path.display(), width, height, fps, "Opened MJPEG writer");

        Ok(Self {
            file,
            part_path,
            final_path,
            width,
            height,
            fps: fps.max(1),
            position: HEADER_LEN,
            index: Vec::new(),
            max_frame: 0,
        })
    }

    /// Append one JPEG frame
    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), CaptureError> {
        let size = u32::try_from(frame.data.len())
            .map_err(|_| CaptureError::Container("frame larger than 4 GiB".into()))?;
        let offset = u32::try_from(self.position - MOVI_FOURCC_POS)
            .map_err(|_| CaptureError::Container("AVI exceeds 4 GiB".into()))?;

        self.file.write_all(b"00dc")?;
        self.file.write_all(&size.to_le_bytes())?;
        self.file.write_all(&frame.data)?;
        let padded = u64::from(size) + u64::from(size % 2);
        if size % 2 == 1 {
            self.file.write_all(&[0])?;
        }

        self.position += 8 + padded;
        self.max_frame = self.max_frame.max(size);
        self.index.push(IndexEntry { offset, size });
        Ok(())
    }

    /// Frames written so far
    pub fn frames(&self) -> u64 {
        self.index.len() as u64
    }

    /// Final path of the container
    pub fn path(&self) -> &Path {
        &self.final_path
    }

    /// Write the index, patch the header and move the file into place
    ///
    /// Returns the final size in bytes.
    pub fn finish(mut self) -> Result<u64, CaptureError> {
        let index_len = 16 * self.index.len() as u64;
        self.file.write_all(b"idx1")?;
        self.file.write_all(&to_u32(index_len)?.to_le_bytes())?;
        for entry in &self.index {
            self.file.write_all(b"00dc")?;
            self.file.write_all(&AVIIF_KEYFRAME.to_le_bytes())?;
            self.file.write_all(&entry.offset.to_le_bytes())?;
            self.file.write_all(&entry.size.to_le_bytes())?;
        }

        let total_len = self.position + 8 + index_len;
        let movi_size = to_u32(self.position - MOVI_FOURCC_POS)?;
        let riff_size = to_u32(total_len - 8)?;
        let frames = to_u32(self.index.len() as u64)?;

        let header = build_header(
            self.width,
            self.height,
            self.fps,
            frames,
            self.max_frame,
            movi_size,
            riff_size,
        );
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        drop(self.file);

        fs::rename(&self.part_path, &self.final_path)?;
        debug!(
            path = %self.final_path.display(),
            frames,
            bytes = total_len,
            "Finalized MJPEG file"
        );
        Ok(total_len)
    }
}

pub(crate) fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn to_u32(value: u64) -> Result<u32, CaptureError> {
    u32::try_from(value).map_err(|_| CaptureError::Container("AVI exceeds 4 GiB".into()))
}

fn build_header(
    width: u32,
    height: u32,
    fps: u32,
    frames: u32,
    max_frame: u32,
    movi_size: u32,
    riff_size: u32,
) -> Vec<u8> {
    let mut h = HeaderBuf(Vec::with_capacity(HEADER_LEN as usize));
    let buffer_size = max_frame.saturating_add(8);

    h.fourcc(b"RIFF").u32(riff_size).fourcc(b"AVI ");
    h.fourcc(b"LIST").u32(192).fourcc(b"hdrl");

    // Main AVI header
    h.fourcc(b"avih").u32(56);
    h.u32(1_000_000 / fps)
        .u32(max_frame.saturating_mul(fps))
        .u32(0)
        .u32(AVIF_HASINDEX)
        .u32(frames)
        .u32(0)
        .u32(1)
        .u32(buffer_size)
        .u32(width)
        .u32(height)
        .u32(0)
        .u32(0)
        .u32(0)
        .u32(0);

    h.fourcc(b"LIST").u32(116).fourcc(b"strl");

    // Stream header
    h.fourcc(b"strh").u32(56);
    h.fourcc(b"vids")
        .fourcc(b"MJPG")
        .u32(0)
        .u16(0)
        .u16(0)
        .u32(0)
        .u32(1)
        .u32(fps)
        .u32(0)
        .u32(frames)
        .u32(buffer_size)
        .u32(u32::MAX)
        .u32(0)
        .u16(0)
        .u16(0)
        .u16(width.min(u32::from(u16::MAX)) as u16)
        .u16(height.min(u32::from(u16::MAX)) as u16);

    // BITMAPINFOHEADER
    h.fourcc(b"strf").u32(40);
    h.u32(40)
        .u32(width)
        .u32(height)
        .u16(1)
        .u16(24)
        .fourcc(b"MJPG")
        .u32(width.saturating_mul(height).saturating_mul(3))
        .u32(0)
        .u32(0)
        .u32(0)
        .u32(0);

    h.fourcc(b"LIST").u32(movi_size).fourcc(b"movi");
    h.0
}

struct HeaderBuf(Vec<u8>);

impl HeaderBuf {
    fn fourcc(&mut self, tag: &[u8; 4]) -> &mut Self {
        self.0.extend_from_slice(tag);
        self
    }

    fn u32(&mut self, value: u32) -> &mut Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn u16(&mut self, value: u16) -> &mut Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_u32(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn test_header_layout() {
        let header = build_header(640, 480, 20, 0, 0, 4, 0);
        assert_eq!(header.len() as u64, HEADER_LEN);
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(&header[12..16], b"LIST");
        assert_eq!(&header[24..28], b"avih");
        assert_eq!(&header[88..92], b"LIST");
        assert_eq!(&header[100..104], b"strh");
        assert_eq!(&header[164..168], b"strf");
        assert_eq!(&header[212..216], b"LIST");
        assert_eq!(&header[220..224], b"movi");
        // 50 ms per frame
        assert_eq!(read_u32(&header, 32), 50_000);
    }

    #[test]
    fn test_write_and_finish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.avi");

        let mut writer = MjpegAviWriter::create(&path, 4, 4, 10).unwrap();
        // Odd length forces a pad byte
        writer.write_frame(&Frame::new(vec![0xFFu8, 0xD8, 0x01], 4, 4, 0, 0)).unwrap();
        writer.write_frame(&Frame::new(vec![0xFFu8, 0xD8, 0x02, 0x03], 4, 4, 100, 1)).unwrap();
        assert_eq!(writer.frames(), 2);
        assert!(part_path(&path).exists());

        let size = writer.finish().unwrap();
        assert!(path.exists());
        assert!(!part_path(&path).exists());

        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len() as u64, size);
        assert_eq!(read_u32(&bytes, 4) as usize, bytes.len() - 8);
        // dwTotalFrames and dwLength
        assert_eq!(read_u32(&bytes, 48), 2);
        assert_eq!(read_u32(&bytes, 140), 2);

        // movi: fourcc + (8 + 3 + 1) + (8 + 4)
        assert_eq!(read_u32(&bytes, 216), 4 + 12 + 12);
        assert_eq!(&bytes[224..228], b"00dc");
        assert_eq!(read_u32(&bytes, 228), 3);
        assert_eq!(&bytes[236..240], b"00dc");

        let idx = 248;
        assert_eq!(&bytes[idx..idx + 4], b"idx1");
        assert_eq!(read_u32(&bytes, idx + 4), 32);
        assert_eq!(read_u32(&bytes, idx + 16), 4);
        assert_eq!(read_u32(&bytes, idx + 32), 16);
    }
}
