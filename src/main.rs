use clap::Parser;
use lib::{
    CancelableStream, Canceled, CompressionMode, PipelineError, RaceRequest, Racer, RelayConfig,
    SimpleLogger, StationStore, TransformPipeline, racer_url,
};
use log::{debug, info, warn};
use std::fs::File;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

static LOGGER: SimpleLogger = SimpleLogger;

/// Cancels `token` on the first Ctrl-C, so the race stops at its next read.
fn cancel_on_ctrl_c(token: CancellationToken) {
    let spawned = thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!("Ctrl-C handler unavailable: {}", e);
                    return;
                }
            };
            match runtime.block_on(tokio::signal::ctrl_c()) {
                Ok(()) => {
                    info!("Interrupted, canceling race");
                    token.cancel();
                }
                Err(e) => warn!("Ctrl-C handler unavailable: {}", e),
            }
        });
    if let Err(e) = spawned {
        warn!("Ctrl-C handler unavailable: {}", e);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Racer base URL; the document is POSTed to <endpoint>/1brc
    #[arg(short, long)]
    endpoint: String,

    /// Number of rows in the dataset (1000000 or 1000000000 when reading from --data-dir)
    #[arg(short, long)]
    count: u64,

    /// Gzip-compressed station CSV to send
    #[arg(short, long, conflicts_with = "data_dir")]
    input_file: Option<PathBuf>,

    /// Directory of cached station datasets, selected by --count
    #[arg(long, required_unless_present = "input_file")]
    data_dir: Option<PathBuf>,

    /// Racer identifier, for logging
    #[arg(long, default_value = "anonymous")]
    racer_id: String,

    /// Offset added to every temperature
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    epsilon: f64,

    /// When to gzip the outbound body
    #[arg(long, default_value = "auto")]
    compression: CompressionMode,

    /// Row count at which auto compression kicks in
    #[arg(long)]
    threshold: Option<u64>,

    /// Rows decoded per refill
    #[arg(long)]
    batch_size: Option<usize>,

    /// Outbound request timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Log level for output
    #[arg(long, default_value = "false")]
    debug: bool,
}

fn main() -> Result<(), PipelineError> {
    let total_start = Instant::now();
    if log::set_logger(&LOGGER).is_err() {
        eprintln!("logger already installed");
    }

    let args = Args::parse();
    if args.debug {
        log::set_max_level(log::LevelFilter::Debug);
    } else {
        log::set_max_level(log::LevelFilter::Info);
    }

    let defaults = RelayConfig::default();
    let config = RelayConfig {
        epsilon: args.epsilon,
        batch_size: args.batch_size.unwrap_or(defaults.batch_size),
        compression: args.compression,
        compression_threshold: args.threshold.unwrap_or(defaults.compression_threshold),
        timeout: args
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout),
        ..defaults
    };
    debug!(
        "Relay configuration | Epsilon={}, Batch={}, Compression={:?}, Threshold={}, Timeout={:?}",
        config.epsilon,
        config.batch_size,
        config.compression,
        config.compression_threshold,
        config.timeout
    );

    let request = RaceRequest {
        endpoint: args.endpoint,
        count: args.count,
        racer_id: args.racer_id,
    };

    let (key, file) = match (&args.input_file, &args.data_dir) {
        (Some(path), _) => (path.display().to_string(), File::open(path)?),
        (None, Some(dir)) => {
            let data = StationStore::new(dir).station_data(request.count)?;
            (data.key, data.reader)
        }
        (None, None) => {
            return Err(PipelineError::Storage(
                "either --input-file or --data-dir is required".to_string(),
            ));
        }
    };
    println!(
        "Racer {} | Sending {} ({} rows) to {}",
        request.racer_id,
        key,
        request.count,
        racer_url(&request.endpoint)
    );

    let token = CancellationToken::new();
    cancel_on_ctrl_c(token.clone());
    let source = CancelableStream::new(file, token.clone());
    let racer = Racer::new(config)?;

    let outcome = TransformPipeline::new(source.clone(), key, racer.config().epsilon)
        .map(|pipeline| pipeline.with_batch_size(racer.config().batch_size))
        .and_then(|pipeline| {
            racer.race(&racer_url(&request.endpoint), request.count, pipeline, &token)
        });
    if let Err(e) = source.close() {
        if !Canceled::is(&e) {
            return Err(e.into());
        }
        source.teardown();
    }
    let outcome = outcome?;

    println!("elapsed: {:.5}", outcome.elapsed.as_secs_f64());
    match outcome.racer_response() {
        Ok(response) => println!(
            "Racer {} finished race {} (reported {:.5}s)",
            response.racer_id, response.race_id, response.time
        ),
        Err(e) => debug!("Racer response was not a race report: {}", e),
    }

    println!("\nTotal runtime: {:.2?}", total_start.elapsed());
    Ok(())
}
