use std::io::{self, Read};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Error payload carried inside an `io::Error` once a cancellation token has fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canceled;

impl std::fmt::Display for Canceled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("operation canceled")
    }
}

impl std::error::Error for Canceled {}

impl Canceled {
    /// Returns true if `err` was produced by a canceled stream.
    pub fn is(err: &io::Error) -> bool {
        err.get_ref().is_some_and(|inner| inner.is::<Canceled>())
    }
}

impl From<Canceled> for io::Error {
    // Not `Interrupted`: `io::copy` and `read_to_end` retry on that kind.
    fn from(canceled: Canceled) -> Self {
        io::Error::other(canceled)
    }
}

/// Readable, closable byte source that checks a cancellation token before every call.
///
/// Clones share the same underlying resource, so a stage can read through one handle while
/// the owner keeps another and closes it once the whole request is done. A read already in
/// flight is not interrupted; cancellation is observed at the start of the next call.
pub struct CancelableStream<R> {
    token: CancellationToken,
    inner: Arc<Mutex<Option<R>>>,
}

impl<R> Clone for CancelableStream<R> {
    fn clone(&self) -> Self {
        Self {
            token: self.token.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Read> CancelableStream<R> {
    pub fn new(inner: R, token: CancellationToken) -> Self {
        Self {
            token,
            inner: Arc::new(Mutex::new(Some(inner))),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Releases the underlying resource.
    ///
    /// If the token already fired this reports [`Canceled`] instead and leaves teardown to
    /// whoever canceled. Closing an already closed resource is a no-op.
    pub fn close(&self) -> io::Result<()> {
        if self.token.is_cancelled() {
            return Err(Canceled.into());
        }
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("source lock poisoned"))?;
        drop(guard.take());
        Ok(())
    }

    /// Drops the underlying resource whether or not the token fired.
    ///
    /// For the party that canceled: [`close`](Self::close) refuses once the token fires and
    /// leaves the real teardown to it.
    pub fn teardown(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            drop(guard.take());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().map(|guard| guard.is_none()).unwrap_or(true)
    }
}

impl<R: Read> Read for CancelableStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.token.is_cancelled() {
            return Err(Canceled.into());
        }
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("source lock poisoned"))?;
        match guard.as_mut() {
            Some(reader) => reader.read(buf),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "read on closed source",
            )),
        }
    }
}
