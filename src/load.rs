use crate::cancel::CancelableStream;
use crate::error::{PipelineError, Result};
use crate::relay::{CompressionRelay, ErrorSignal};
use crate::structs::{RacerResponse, RelayConfig};
use crate::transform::TransformPipeline;
use log::{debug, info, warn};
use reqwest::blocking::{Body, Client, Request};
use reqwest::header::CONTENT_ENCODING;
use reqwest::{StatusCode, Url};
use std::io::{self, Read};
use std::thread;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Path appended to a racer endpoint.
pub const RACER_PATH: &str = "1brc";

/// Outbound request plus the error signal of the relay feeding its body, if any.
pub struct RacerRequest {
    pub request: Request,
    pub errors: ErrorSignal,
    pub compressed: bool,
    /// Drops the body even while the request is owned by the HTTP client
    pub teardown: Box<dyn FnOnce() + Send>,
}

/// Timing and payload of a completed race.
#[derive(Debug, Clone)]
pub struct RaceOutcome {
    /// From just before sending the request until the response body was fully read
    pub elapsed: Duration,
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl RaceOutcome {
    /// Decodes the body as a racer's JSON reply.
    pub fn racer_response(&self) -> Result<RacerResponse> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Builds the racer URL for an endpoint, e.g. `http://host:8080` -> `http://host:8080/1brc`.
pub fn racer_url(endpoint: &str) -> String {
    format!("{}/{}", endpoint.trim_end_matches('/'), RACER_PATH)
}

/// Builds the POST carrying the pipeline's document.
///
/// Below the compression threshold the pipeline itself is the body. Otherwise a
/// [`CompressionRelay`] is interposed and `Content-Encoding: gzip` is set. The returned
/// signal is already closed when no relay was started, so callers can always wait on it.
///
/// Either body checks `token` before every read, so a fired token fails the upload at the
/// next chunk even when the pipeline still has buffered bytes.
///
/// # Errors
///
/// Returns `PipelineError::Io` for an unusable URL or if the relay thread cannot be started,
/// and `PipelineError::Transport` if the request cannot be assembled.
pub fn build_racer_request<S>(
    client: &Client,
    url: &str,
    row_hint: u64,
    pipeline: TransformPipeline<S>,
    config: &RelayConfig,
    token: &CancellationToken,
) -> Result<RacerRequest>
where
    S: Read + Send + 'static,
{
    let url = Url::parse(url)
        .map_err(|e| PipelineError::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

    if !config.compresses(row_hint) {
        debug!("Streaming {} uncompressed to {}", pipeline.source_id(), url);
        let body = CancelableStream::new(pipeline, token.clone());
        let handle = body.clone();
        let request = client.post(url).body(Body::new(body)).build()?;
        return Ok(RacerRequest {
            request,
            errors: ErrorSignal::closed(),
            compressed: false,
            teardown: Box::new(move || handle.teardown()),
        });
    }

    debug!("Streaming {} gzip-compressed to {}", pipeline.source_id(), url);
    let (pipe, errors) = CompressionRelay::new(config.compression_level).spawn(pipeline)?;
    let body = CancelableStream::new(pipe, token.clone());
    let handle = body.clone();
    let request = client
        .post(url)
        .header(CONTENT_ENCODING, "gzip")
        .body(Body::new(body))
        .build()?;
    Ok(RacerRequest {
        request,
        errors,
        compressed: true,
        teardown: Box::new(move || handle.teardown()),
    })
}

/// Sends transformed station data to racers and times how long they take to answer.
pub struct Racer {
    client: Client,
    config: RelayConfig,
    runtime: Runtime,
}

impl Racer {
    /// # Errors
    ///
    /// Returns `PipelineError::Transport` if the HTTP client cannot be built, or
    /// `PipelineError::Io` if the runtime that watches for cancellation cannot start.
    pub fn new(config: RelayConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        let runtime = tokio::runtime::Builder::new_current_thread().build()?;
        Ok(Self {
            client,
            config,
            runtime,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Streams the pipeline to `url` and waits for the racer's full response.
    ///
    /// The call runs on a worker thread while this thread waits for either its result or
    /// `token`. On cancellation the body is torn down, the relay signal is still drained,
    /// and `PipelineError::Canceled` is returned without waiting for the racer.
    ///
    /// Otherwise failures are checked in order: the transport call, then the relay's error
    /// signal (consulted exactly once, even when the transport failed), then the status.
    pub fn race<S>(
        &self,
        url: &str,
        row_hint: u64,
        pipeline: TransformPipeline<S>,
        token: &CancellationToken,
    ) -> Result<RaceOutcome>
    where
        S: Read + Send + 'static,
    {
        let RacerRequest {
            request,
            errors,
            compressed,
            teardown,
        } = build_racer_request(&self.client, url, row_hint, pipeline, &self.config, token)?;
        info!(
            "Racing {} rows to {} (compressed: {})",
            row_hint,
            request.url(),
            compressed
        );

        let (tx, rx) = oneshot::channel();
        let client = self.client.clone();
        let start = Instant::now();
        let spawned = thread::Builder::new()
            .name("racer-request".to_string())
            .spawn(move || {
                let sent = client.execute(request).and_then(|response| {
                    let status = response.status();
                    response.bytes().map(|body| (status, body))
                });
                let _ = tx.send(sent);
            });
        if let Err(e) = spawned {
            teardown();
            let _ = errors.wait();
            return Err(e.into());
        }

        let sent = self.runtime.block_on(async {
            tokio::select! {
                sent = rx => Some(sent),
                () = token.cancelled() => None,
            }
        });
        let elapsed = start.elapsed();

        let Some(sent) = sent else {
            teardown();
            if let Err(relay_err) = errors.wait() {
                if !relay_err.is_canceled() {
                    warn!("Relay failed while canceling: {}", relay_err);
                }
            }
            info!(
                "Race to {} canceled after {:.3}s",
                url,
                elapsed.as_secs_f64()
            );
            return Err(PipelineError::Canceled);
        };
        let relayed = errors.wait();

        let sent = sent.map_err(|_| io::Error::other("racer request worker exited"))?;
        let (status, body) = match sent {
            Ok(sent) => sent,
            Err(err) => {
                if let Err(relay_err) = relayed {
                    warn!("Relay also failed: {}", relay_err);
                }
                if token.is_cancelled() {
                    return Err(PipelineError::Canceled);
                }
                return Err(err.into());
            }
        };
        relayed.map_err(|e| {
            if e.is_canceled() {
                PipelineError::Canceled
            } else {
                e
            }
        })?;
        if !status.is_success() {
            return Err(PipelineError::Status(status.as_u16()));
        }

        info!("Racer answered {} in {:.5}s", status, elapsed.as_secs_f64());
        Ok(RaceOutcome {
            elapsed,
            status,
            body: body.to_vec(),
        })
    }
}
