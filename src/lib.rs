pub mod cancel;
pub mod error;
pub mod load;
pub mod relay;
pub mod storage;
pub mod structs;
pub mod transform;

// Re-export public API
pub use cancel::{CancelableStream, Canceled};
pub use error::{PipelineError, RelayStage, Result};
pub use load::{RaceOutcome, Racer, RacerRequest, build_racer_request, racer_url};
pub use relay::{CompressionRelay, ErrorSignal, PipeReader, PipeWriter, pipe};
pub use storage::{StationData, StationStore};
pub use structs::{
    CompressionMode, Measurement, RaceRequest, RacerResponse, RelayConfig, RoundedTemperature,
    SimpleLogger,
};
pub use transform::{Pull, TransformPipeline};
