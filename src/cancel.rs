use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::BundlerError;

const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Shared cancellation flag handed to every network call, archive copy and
/// process wait of a bundle run. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), BundlerError> {
        if self.is_cancelled() {
            return Err(BundlerError::Cancelled);
        }
        Ok(())
    }

    /// Sleeps for `duration`, waking early with `Cancelled` once the token fires.
    pub fn sleep(&self, duration: Duration) -> Result<(), BundlerError> {
        // A deadline past the representable range only ends by cancellation.
        let deadline = Instant::now().checked_add(duration);
        loop {
            self.check()?;
            let now = Instant::now();
            let remaining = match deadline {
                Some(deadline) if now >= deadline => return Ok(()),
                Some(deadline) => deadline - now,
                None => SLEEP_SLICE,
            };
            thread::sleep(SLEEP_SLICE.min(remaining));
        }
    }

    /// Cancels the token from a watchdog thread once `deadline` elapses.
    pub fn cancel_after(&self, deadline: Duration) {
        let token = self.clone();
        thread::spawn(move || {
            if token.sleep(deadline).is_ok() {
                token.cancel();
            }
        });
    }
}

/// Reader that fails as soon as the token is cancelled.
pub struct CancellableReader<'a, R> {
    inner: R,
    token: &'a CancellationToken,
}

impl<'a, R: Read> CancellableReader<'a, R> {
    pub fn new(inner: R, token: &'a CancellationToken) -> Self {
        Self { inner, token }
    }
}

impl<R: Read> Read for CancellableReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.token.is_cancelled() {
            // ErrorKind::Interrupted would be retried by io::copy.
            return Err(io::Error::other("operation cancelled"));
        }
        self.inner.read(buf)
    }
}
