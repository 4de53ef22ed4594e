use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use crate::error::Result;
use crate::statelog::encode_frame;

fn is_out_of_space(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::StorageFull || err.raw_os_error() == Some(28)
}

/// An append-only frame writer over one file.
///
/// Writes buffer in process until `flush` (or drop) pushes them to the
/// kernel. Running out of disk space is a correctness boundary for shared
/// state and aborts the process after logging.
pub struct ChecksummedWriter {
    path: PathBuf,
    file: BufWriter<std::fs::File>,
    written: u64,
    dirty: bool,
}

impl ChecksummedWriter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        info!(path = %path.display(), "statelog.open");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(ChecksummedWriter {
            path,
            file: BufWriter::new(file),
            written: 0,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Frames and writes one payload. The bytes are in the writer's buffer
    /// when this returns; `flush` moves them to the kernel.
    pub fn append(&mut self, payload: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(payload.len() + super::FRAME_HEADER_LEN);
        encode_frame(payload, &mut frame);

        if let Err(err) = self.file.write_all(&frame) {
            if is_out_of_space(&err) {
                error!(path = %self.path.display(), "no space left on state log device");
                std::process::abort();
            }
            return Err(err.into());
        }

        self.written += frame.len() as u64;
        self.dirty = true;
        Ok(())
    }

    /// Pushes buffered bytes to the kernel side of the descriptor.
    pub fn flush(&mut self) -> Result<()> {
        if let Err(err) = self.file.flush() {
            if is_out_of_space(&err) {
                error!(path = %self.path.display(), "no space left on state log device");
                std::process::abort();
            }
            error!(path = %self.path.display(), %err, "state log flush failed");
            return Err(err.into());
        }
        self.dirty = false;
        Ok(())
    }

    /// Bytes written through this writer, framing included.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn file_size(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }
}

impl Drop for ChecksummedWriter {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "statelog.close");
        if self.dirty {
            let _ = self.flush();
        }
    }
}
