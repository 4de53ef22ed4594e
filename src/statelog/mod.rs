#![forbid(unsafe_code)]

//! Checksummed append-only persistence for shared state.
//!
//! Frame format, little-endian: `[crc32: u32][len: u64][payload: len bytes]`.
//! The crc covers the payload only. A reader consumes frames until end of
//! file or the first frame that fails validation; everything before that
//! point is trusted, everything after is ignored and never rewritten.

mod open_files;
mod writer;

pub use open_files::OpenFiles;
pub use writer::ChecksummedWriter;

use std::fs;
use std::path::Path;

use tracing::error;

use crate::error::Result;

pub(crate) const FRAME_HEADER_LEN: usize = 12;

/// Result of scanning a log file: the validated payload prefix, and whether
/// the scan stopped early on a damaged or truncated frame.
#[derive(Debug, Default)]
pub struct FrameReadOutcome {
    pub frames: Vec<Vec<u8>>,
    pub truncated: bool,
}

pub(crate) fn encode_frame(payload: &[u8], out: &mut Vec<u8>) {
    let crc = crc32fast::hash(payload);
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(payload);
}

/// Reads every validated frame of the file at `path`.
pub fn read_frames(path: impl AsRef<Path>) -> Result<FrameReadOutcome> {
    let bytes = fs::read(path.as_ref())?;
    let mut outcome = FrameReadOutcome::default();
    let mut cursor = 0usize;

    while cursor < bytes.len() {
        if bytes.len() - cursor < FRAME_HEADER_LEN {
            error!(
                path = %path.as_ref().display(),
                offset = cursor,
                "log frame header truncated"
            );
            outcome.truncated = true;
            break;
        }
        let crc = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().expect("crc bytes"));
        let len = u64::from_le_bytes(
            bytes[cursor + 4..cursor + 12].try_into().expect("len bytes"),
        ) as usize;
        let start = cursor + FRAME_HEADER_LEN;

        if len > bytes.len() - start {
            error!(
                path = %path.as_ref().display(),
                offset = cursor,
                declared = len,
                remaining = bytes.len() - start,
                "log frame larger than remaining file"
            );
            outcome.truncated = true;
            break;
        }

        let payload = &bytes[start..start + len];
        if crc32fast::hash(payload) != crc {
            error!(
                path = %path.as_ref().display(),
                offset = cursor,
                "log frame failed its checksum"
            );
            outcome.truncated = true;
            break;
        }

        outcome.frames.push(payload.to_vec());
        cursor = start + len;
    }

    Ok(outcome)
}
