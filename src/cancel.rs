use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

/// How often a caller blocked on a worker looks at the token.
const POLL_INTERVAL: Duration = Duration::from_millis(20);
const CHUNK_SIZE: usize = 64 * 1024;

/// Set once SIGINT/SIGTERM arrives. Every blocking step that can be
/// interrupted takes one of these and checks it at its own safe points.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route interrupt and terminate to this token for the rest of the process.
    ///
    /// The handler only records the signal. Every step before the downstream
    /// hand-off checks the token; once the downstream tool runs, the signal is
    /// left to it.
    pub fn install_signal_handler(&self) -> Result<(), ctrlc::Error> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            debug!("received interrupt");
            token.cancel();
        })
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Marker error for work abandoned because the token was set.
#[derive(Debug)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("operation cancelled")
    }
}

impl std::error::Error for Cancelled {}

fn cancelled_io() -> io::Error {
    io::Error::new(io::ErrorKind::Other, Cancelled)
}

/// Run `work` on a worker thread and wait for it, giving up as soon as the
/// token is set. An abandoned worker runs to completion on its own and its
/// result is dropped.
pub fn run_cancellable<T, F>(token: &CancelToken, work: F) -> Result<T, Cancelled>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    token.check()?;
    let handle = std::thread::spawn(work);
    while !handle.is_finished() {
        token.check()?;
        std::thread::sleep(POLL_INTERVAL);
    }
    match handle.join() {
        Ok(value) => Ok(value),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Reader fed by a worker thread, so a read stuck in the network stack
/// never delays cancellation. Errors with [`Cancelled`] once the token is set.
pub struct CancellableReader {
    chunks: Receiver<io::Result<Vec<u8>>>,
    pending: Vec<u8>,
    pos: usize,
    done: bool,
    token: CancelToken,
}

impl CancellableReader {
    pub fn spawn<R: Read + Send + 'static>(mut inner: R, token: CancelToken) -> Self {
        let (tx, rx) = mpsc::sync_channel(4);
        std::thread::spawn(move || {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let chunk = match inner.read(&mut buf) {
                    Ok(n) => Ok(buf[..n].to_vec()),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => Err(e),
                };
                // An empty chunk is end of stream.
                let last = !matches!(&chunk, Ok(c) if !c.is_empty());
                if tx.send(chunk).is_err() || last {
                    break;
                }
            }
        });
        CancellableReader {
            chunks: rx,
            pending: Vec::new(),
            pos: 0,
            done: false,
            token,
        }
    }
}

impl Read for CancellableReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.token.is_cancelled() {
            return Err(cancelled_io());
        }
        while self.pos == self.pending.len() {
            if self.done {
                return Ok(0);
            }
            match self.chunks.recv_timeout(POLL_INTERVAL) {
                Ok(Ok(chunk)) => {
                    self.done = chunk.is_empty();
                    self.pending = chunk;
                    self.pos = 0;
                }
                Ok(Err(e)) => {
                    self.done = true;
                    return Err(e);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.token.is_cancelled() {
                        return Err(cancelled_io());
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.done = true;
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended without end-of-file",
                    ));
                }
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
