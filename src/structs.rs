use log::{Log, Metadata, Record as LogRecord};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::value::RawValue;
use std::time::Duration;

/// Simple logger implementation
pub struct SimpleLogger;

impl Log for SimpleLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &LogRecord) {
        println!(
            "{} [{}] {}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// One station reading as it appears in the outbound JSON document.
///
/// Borrows the station name from the row being decoded; nothing is retained between rows.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Measurement<'a> {
    pub station: &'a str,
    pub temperature: RoundedTemperature,
}

/// Temperature rendered with exactly five fractional digits (`1.00000`, `-0.25000`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundedTemperature(pub f64);

impl RoundedTemperature {
    pub const DECIMALS: usize = 5;
}

impl std::fmt::Display for RoundedTemperature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.*}", Self::DECIMALS, self.0)
    }
}

impl Serialize for RoundedTemperature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // Emitted verbatim; NaN/inf are not JSON numbers and fail here.
        let literal = RawValue::from_string(self.to_string()).map_err(serde::ser::Error::custom)?;
        literal.serialize(serializer)
    }
}

/// When the outbound body is gzip-compressed on the fly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CompressionMode {
    /// Compress once the row-count hint reaches the threshold
    #[default]
    Auto,
    Always,
    Never,
}

/// Configuration for one transform-and-forward run
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Offset added to every temperature
    pub epsilon: f64,
    /// Rows decoded per pipeline refill
    pub batch_size: usize,
    pub compression: CompressionMode,
    /// Row-count hint at which `Auto` starts compressing
    pub compression_threshold: u64,
    /// gzip level, 0-9
    pub compression_level: u32,
    /// Outbound request timeout; large payloads take a long time to stream
    pub timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.0,
            batch_size: 500,
            compression: CompressionMode::Auto,
            compression_threshold: 10_000_000,
            compression_level: 6,
            timeout: Duration::from_secs(2 * 60 * 60),
        }
    }
}

impl RelayConfig {
    /// Whether a body for `row_hint` rows goes through the compression relay.
    pub fn compresses(&self, row_hint: u64) -> bool {
        match self.compression {
            CompressionMode::Auto => row_hint >= self.compression_threshold,
            CompressionMode::Always => true,
            CompressionMode::Never => false,
        }
    }
}

/// Inbound race request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceRequest {
    pub endpoint: String,
    pub count: u64,
    pub racer_id: String,
}

/// Body returned by a racer once it has consumed the document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RacerResponse {
    pub racer_id: String,
    pub race_id: String,
    pub time: f32,
}
