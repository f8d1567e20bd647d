use crate::cancel::Canceled;
use crate::error::{PipelineError, Result};
use crate::structs::{Measurement, RoundedTemperature};
use csv::{ReaderBuilder, StringRecord};
use flate2::read::MultiGzDecoder;
use log::{debug, info};
use std::io::{self, BufRead, BufReader, Read};

/// Rows decoded per refill when no batch size is given.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// First field of the header row, skipped only when it is the very first row.
pub const HEADER_SENTINEL: &str = "station";

const ARRAY_OPEN: &[u8] = b"[\n";
const ARRAY_CLOSE: &[u8] = b"\n]";
const SEPARATOR: &[u8] = b",\n";
const PROGRESS_EVERY: u64 = 10_000_000;

/// Result of a single [`TransformPipeline::pull`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pull {
    /// Bytes copied into the caller's buffer
    pub written: usize,
    /// The document is complete; `written` bytes are its final chunk
    pub done: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Streaming,
    Finished,
    Failed,
    Closed,
}

/// Streams gzip-compressed `station,temperature` rows out as one JSON array.
///
/// Rows are decoded lazily, a batch at a time, only when everything produced so far has been
/// handed to the caller. Memory use is bounded by one batch of serialized rows regardless of
/// the size of the input.
///
/// Closing the pipeline releases the decompressor. If `S` is a shared handle (for example a
/// [`crate::cancel::CancelableStream`] clone), the underlying source stays open for its owner.
pub struct TransformPipeline<S: Read> {
    reader: Option<csv::Reader<BufReader<MultiGzDecoder<S>>>>,
    record: StringRecord,
    source_id: String,
    epsilon: f64,
    batch_size: usize,
    rows: u64,
    header_checked: bool,
    buffer: Vec<u8>,
    pos: usize,
    state: State,
}

impl<S: Read> TransformPipeline<S> {
    /// Opens the gzip container and prepares the array framing.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Source` if the input is not a gzip stream, or
    /// `PipelineError::Canceled` if the source was already canceled.
    pub fn new(source: S, source_id: impl Into<String>, epsilon: f64) -> Result<Self> {
        let source_id = source_id.into();
        let mut decompressed = BufReader::new(MultiGzDecoder::new(source));
        decompressed.fill_buf().map_err(|e| {
            if Canceled::is(&e) {
                PipelineError::Canceled
            } else {
                PipelineError::Source(e)
            }
        })?;
        debug!("Opened compressed station data from {}", source_id);

        let reader = ReaderBuilder::new()
            .has_headers(false)
            .from_reader(decompressed);

        Ok(Self {
            reader: Some(reader),
            record: StringRecord::new(),
            source_id,
            epsilon,
            batch_size: DEFAULT_BATCH_SIZE,
            rows: 0,
            header_checked: false,
            buffer: ARRAY_OPEN.to_vec(),
            pos: 0,
            state: State::Streaming,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Rows emitted so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Fills `dest` with the next bytes of the document.
    ///
    /// The final chunk comes back with `done == true`; later calls return `written == 0`.
    ///
    /// # Errors
    ///
    /// A malformed temperature fails the pull with `PipelineError::Parse`. After any error the
    /// pipeline yields no more bytes and every later pull fails.
    pub fn pull(&mut self, dest: &mut [u8]) -> Result<Pull> {
        match self.state {
            State::Failed => {
                return Err(PipelineError::Io(io::Error::other(
                    "pipeline previously failed",
                )));
            }
            State::Closed => return Err(PipelineError::Closed),
            State::Streaming | State::Finished => {}
        }

        while self.pos == self.buffer.len() && self.state == State::Streaming {
            self.buffer.clear();
            self.pos = 0;
            if let Err(e) = self.refill() {
                self.state = State::Failed;
                return Err(e);
            }
        }

        let pending = &self.buffer[self.pos..];
        let written = pending.len().min(dest.len());
        dest[..written].copy_from_slice(&pending[..written]);
        self.pos += written;

        Ok(Pull {
            written,
            done: self.state == State::Finished && self.pos == self.buffer.len(),
        })
    }

    /// Releases the decompressor. Any later pull fails with `PipelineError::Closed`.
    pub fn close(&mut self) {
        if self.reader.take().is_some() {
            debug!(
                "Closed pipeline for {} after {} rows",
                self.source_id, self.rows
            );
        }
        self.buffer = Vec::new();
        self.pos = 0;
        self.state = State::Closed;
    }

    /// Decodes up to one batch of rows into the buffer, closing the array at end of input.
    fn refill(&mut self) -> Result<()> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(PipelineError::Closed);
        };

        for _ in 0..self.batch_size {
            let more = reader.read_record(&mut self.record).map_err(from_csv)?;
            if !more {
                self.buffer.extend_from_slice(ARRAY_CLOSE);
                self.state = State::Finished;
                info!(
                    "Completed downloading cached station data from {} ({} rows)",
                    self.source_id, self.rows
                );
                return Ok(());
            }

            if !self.header_checked {
                self.header_checked = true;
                if self.record.get(0) == Some(HEADER_SENTINEL) {
                    continue;
                }
            }

            let station = self.record.get(0).unwrap_or_default();
            let raw = self.record.get(1).unwrap_or_default();
            let temperature = parse_temperature(raw).ok_or_else(|| PipelineError::Parse {
                row: self.rows,
                raw: raw.to_string(),
            })?;

            if self.rows > 0 {
                self.buffer.extend_from_slice(SEPARATOR);
            }
            let measurement = Measurement {
                station,
                temperature: RoundedTemperature(temperature + self.epsilon),
            };
            serde_json::to_writer(&mut self.buffer, &measurement)?;

            self.rows += 1;
            if self.rows % PROGRESS_EVERY == 0 {
                info!("Streamed {} rows from {}", self.rows, self.source_id);
            }
        }
        Ok(())
    }
}

impl<S: Read> Read for TransformPipeline<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.pull(buf)?.written)
    }
}

/// Parses a finite `f64`; anything else (including NaN and infinities) is rejected.
fn parse_temperature(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|t| t.is_finite())
}

fn from_csv(err: csv::Error) -> PipelineError {
    if matches!(err.kind(), csv::ErrorKind::Io(io) if Canceled::is(io)) {
        PipelineError::Canceled
    } else {
        PipelineError::Csv(err)
    }
}
