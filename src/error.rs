use crate::cancel::Canceled;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("I/O Error: {0}")]
    Io(#[from] io::Error),
    #[error("Source Error: cannot open compressed station data: {0}")]
    Source(#[source] io::Error),
    #[error("Parse Error: row {row}: invalid temperature '{raw}'")]
    Parse { row: u64, raw: String },
    #[error("Relay Error: {stage} failed: {source}")]
    Relay {
        stage: RelayStage,
        #[source]
        source: io::Error,
    },
    #[error("operation canceled")]
    Canceled,
    #[error("Transport Error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("racer status {0}")]
    Status(u16),
    #[error("Storage Error: {0}")]
    Storage(String),
    #[error("CSV Error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON Error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("pipeline closed")]
    Closed,
}

/// Step of the background compression task that produced a [`PipelineError::Relay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStage {
    Drain,
    Compress,
    Close,
}

impl std::fmt::Display for RelayStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RelayStage::Drain => "drain",
            RelayStage::Compress => "compressor close",
            RelayStage::Close => "pipe close",
        };
        f.write_str(name)
    }
}

impl PipelineError {
    /// True when the error is, or wraps, a fired cancellation token.
    pub fn is_canceled(&self) -> bool {
        match self {
            PipelineError::Canceled => true,
            PipelineError::Io(e) | PipelineError::Source(e) => Canceled::is(e),
            PipelineError::Relay { source, .. } => Canceled::is(source),
            PipelineError::Csv(e) => match e.kind() {
                csv::ErrorKind::Io(io) => Canceled::is(io),
                _ => false,
            },
            _ => false,
        }
    }
}

impl From<PipelineError> for io::Error {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Io(e) => e,
            PipelineError::Canceled => Canceled.into(),
            e if e.is_canceled() => Canceled.into(),
            e @ PipelineError::Parse { .. } => io::Error::new(io::ErrorKind::InvalidData, e),
            e => io::Error::other(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
