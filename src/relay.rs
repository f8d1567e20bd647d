use crate::error::{PipelineError, RelayStage, Result};
use crossbeam_channel::{Receiver, Sender};
use flate2::Compression;
use flate2::write::GzEncoder;
use log::{debug, warn};
use std::io::{self, Read, Write};
use std::thread;

/// Creates a synchronous in-process pipe.
///
/// The channel has no capacity: every write blocks until the reader takes the chunk, so the
/// producer can never run ahead of the consumer by more than one write.
pub fn pipe() -> (PipeReader, PipeWriter) {
    let (tx, rx) = crossbeam_channel::bounded(0);
    (
        PipeReader {
            rx,
            chunk: Vec::new(),
            pos: 0,
        },
        PipeWriter { tx: Some(tx) },
    )
}

/// Read end of [`pipe`]. Sees EOF once the writer is closed; dropping it closes the pipe.
pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos == self.chunk.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = (self.chunk.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Write end of [`pipe`].
pub struct PipeWriter {
    tx: Option<Sender<Vec<u8>>>,
}

impl PipeWriter {
    /// Closes the write side; the reader drains what it has and then sees EOF.
    pub fn close(&mut self) -> io::Result<()> {
        drop(self.tx.take());
        Ok(())
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let tx = self.tx.as_ref().ok_or_else(closed_pipe)?;
        tx.send(buf.to_vec()).map_err(|_| closed_pipe())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Payload of the error a [`PipeWriter`] returns once its reader is gone.
#[derive(Debug)]
struct ClosedPipe;

impl std::fmt::Display for ClosedPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("io: read/write on closed pipe")
    }
}

impl std::error::Error for ClosedPipe {}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, ClosedPipe)
}

/// A closed pipe means the consumer went away, which is a cancellation and not a failure.
///
/// Only this pipe's own error counts; a `BrokenPipe` coming up from the source is a failure.
fn is_closed_pipe(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<ClosedPipe>())
}

/// One-shot result of a background relay: at most one error, then closed.
///
/// Always consult it after the consuming call returns; the relay can fail after the last
/// byte the consumer needed was already delivered.
pub struct ErrorSignal {
    rx: Receiver<PipelineError>,
}

impl ErrorSignal {
    fn channel() -> (FirstError, ErrorSignal) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (FirstError { tx: Some(tx) }, ErrorSignal { rx })
    }

    /// A signal with no producer, resolving to success immediately.
    pub fn closed() -> Self {
        let (_, signal) = Self::channel();
        signal
    }

    /// Blocks until the relay has finished, returning its first error if any.
    pub fn wait(self) -> Result<()> {
        match self.rx.recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }
}

/// Sending half of [`ErrorSignal`]; forwards only the first reported error.
struct FirstError {
    tx: Option<Sender<PipelineError>>,
}

impl FirstError {
    fn report(&mut self, stage: RelayStage, result: io::Result<()>) {
        let Err(err) = result else { return };
        if is_closed_pipe(&err) {
            debug!("Relay {} stopped: reader closed the pipe", stage);
            return;
        }
        match self.tx.take() {
            Some(tx) => {
                let _ = tx.send(PipelineError::Relay { stage, source: err });
            }
            None => warn!("Dropping additional relay error during {}: {}", stage, err),
        }
    }
}

/// Re-compresses a byte stream with gzip on a background thread.
pub struct CompressionRelay {
    level: Compression,
}

impl Default for CompressionRelay {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl CompressionRelay {
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }

    /// Starts draining `source` through gzip into a pipe and returns the pipe's read end.
    ///
    /// The background thread closes the compressor and then the pipe whatever the drain
    /// outcome, and reports the first failure through the returned [`ErrorSignal`]. A reader
    /// that closes early is not reported.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Io` if the thread cannot be spawned.
    pub fn spawn<R>(&self, mut source: R) -> Result<(PipeReader, ErrorSignal)>
    where
        R: Read + Send + 'static,
    {
        let (body, writer) = pipe();
        let (mut errors, signal) = ErrorSignal::channel();
        let mut compressor = GzEncoder::new(writer, self.level);

        thread::Builder::new()
            .name("compression-relay".to_string())
            .spawn(move || {
                let copied = io::copy(&mut source, &mut compressor);
                if let Ok(bytes) = copied {
                    debug!("Relay drained {} uncompressed bytes", bytes);
                }
                errors.report(RelayStage::Drain, copied.map(|_| ()));
                errors.report(RelayStage::Compress, compressor.try_finish());
                errors.report(RelayStage::Close, compressor.get_mut().close());
            })?;

        Ok((body, signal))
    }
}
