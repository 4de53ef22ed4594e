use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::error::{NimbusError, Result};
use crate::statelog::writer::ChecksummedWriter;
use crate::statelog::FrameReadOutcome;

struct OpenState {
    writers: LruCache<PathBuf, ChecksummedWriter>,
    shutdown: bool,
    flusher_running: bool,
}

struct Shared {
    state: Mutex<OpenState>,
    tick: Condvar,
    flush_interval: Duration,
}

/// A bounded cache of open state-log writers with a background flusher.
///
/// At most `max_open` writers stay open; opening one more evicts the least
/// recently used, flushing it on the way out. A background loop wakes about
/// once a second and flushes every writer dirtied since the previous tick.
/// `shutdown` stops the loop and closes everything; it must be called before
/// drop (drop warns and does it anyway).
pub struct OpenFiles {
    shared: Arc<Shared>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl OpenFiles {
    pub fn new(max_open: usize) -> Arc<Self> {
        Self::with_flush_interval(max_open, Duration::from_secs(1))
    }

    pub fn with_flush_interval(max_open: usize, flush_interval: Duration) -> Arc<Self> {
        let capacity = NonZeroUsize::new(max_open.max(1)).expect("nonzero capacity");
        Arc::new(OpenFiles {
            shared: Arc::new(Shared {
                state: Mutex::new(OpenState {
                    writers: LruCache::new(capacity),
                    shutdown: false,
                    flusher_running: false,
                }),
                tick: Condvar::new(),
                flush_interval,
            }),
            flusher: Mutex::new(None),
        })
    }

    /// Frames `payload` onto the log at `path`, opening (and possibly
    /// evicting) a writer as needed.
    pub fn append(&self, path: impl AsRef<Path>, payload: &[u8]) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let mut state = self.shared.state.lock();
        if state.shutdown {
            warn!(path = %path.display(), "append after shutdown; content not written");
            return Err(NimbusError::Rejected("state log is shut down"));
        }

        if state.writers.get_mut(&path).is_none() {
            info!(
                path = %path.display(),
                open = state.writers.len(),
                "statelog.open_files.open"
            );
            let writer = ChecksummedWriter::open(&path)?;
            if let Some((evicted_path, evicted)) = state.writers.push(path.clone(), writer) {
                if evicted_path != path {
                    info!(
                        path = %evicted_path.display(),
                        "statelog.open_files.evict"
                    );
                    drop(evicted); // flushes on the way out
                }
            }
        }

        let writer = state
            .writers
            .get_mut(&path)
            .expect("writer just inserted");
        writer.append(payload)?;
        drop(state);

        self.ensure_flusher();
        Ok(())
    }

    /// Synchronously flushes the writer for `path`, if open.
    pub fn flush(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut state = self.shared.state.lock();
        if let Some(writer) = state.writers.get_mut(&path.as_ref().to_path_buf()) {
            writer.flush()?;
        }
        Ok(())
    }

    /// Closes the writer for `path`, flushing it.
    pub fn close_file(&self, path: impl AsRef<Path>) {
        let mut state = self.shared.state.lock();
        state.writers.pop(&path.as_ref().to_path_buf());
    }

    /// Bytes written through the currently open writer of `path`.
    pub fn written(&self, path: impl AsRef<Path>) -> u64 {
        let state = self.shared.state.lock();
        state
            .writers
            .peek(&path.as_ref().to_path_buf())
            .map(ChecksummedWriter::written)
            .unwrap_or(0)
    }

    pub fn open_count(&self) -> usize {
        self.shared.state.lock().writers.len()
    }

    /// Reads the validated frame payloads of the file at `path`.
    pub fn read_file_as_payload_vector(&self, path: impl AsRef<Path>) -> Result<FrameReadOutcome> {
        // flush any open writer first so the reader sees everything appended
        self.flush(path.as_ref())?;
        super::read_frames(path)
    }

    /// Stops the background flusher and closes every writer.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            self.shared.tick.notify_all();
        }

        if let Some(handle) = self.flusher.lock().take() {
            info!("statelog.flush_loop.join");
            let _ = handle.join();
        }

        let mut state = self.shared.state.lock();
        while state.writers.pop_lru().is_some() {}
    }

    fn ensure_flusher(&self) {
        let mut flusher = self.flusher.lock();
        if flusher.is_some() {
            return;
        }
        {
            let mut state = self.shared.state.lock();
            if state.shutdown || state.flusher_running {
                return;
            }
            state.flusher_running = true;
        }
        let shared = Arc::clone(&self.shared);
        *flusher = Some(
            std::thread::Builder::new()
                .name("statelog-flush".into())
                .spawn(move || flush_loop(&shared))
                .expect("spawning state log flusher"),
        );
    }
}

fn flush_loop(shared: &Shared) {
    info!("statelog.flush_loop.start");
    let mut state = shared.state.lock();
    loop {
        shared
            .tick
            .wait_for(&mut state, shared.flush_interval);
        if state.shutdown {
            break;
        }
        let mut flushed = 0usize;
        for (_, writer) in state.writers.iter_mut() {
            if writer.is_dirty() {
                let _ = writer.flush();
                flushed += 1;
            }
        }
        if flushed > 0 {
            debug!(flushed, "statelog.flush_loop.tick");
        }
    }
    info!("statelog.flush_loop.exit");
}

impl Drop for OpenFiles {
    fn drop(&mut self) {
        let shut = self.shared.state.lock().shutdown;
        if !shut {
            warn!("OpenFiles dropped without shutdown");
            self.shutdown();
        }
    }
}
