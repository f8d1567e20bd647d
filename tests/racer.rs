use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use lib::{
    CancelableStream, CompressionMode, PipelineError, RaceOutcome, Racer, RelayConfig,
    TransformPipeline, racer_url,
};
use std::io::{self, Cursor, Read, Write};
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn gzip(text: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

fn station_rows(n: usize) -> String {
    let mut text = String::from("station,temperature\n");
    for i in 0..n {
        text.push_str(&format!("Station {},{}.{}\n", i % 13, (i % 80) as i64 - 30, i % 10));
    }
    text
}

/// Cancels its token once the wrapped reader has served `reads` reads.
struct CancelAfter<R> {
    inner: R,
    reads: usize,
    token: CancellationToken,
}

impl<R: Read> Read for CancelAfter<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.reads = self.reads.saturating_sub(1);
        if self.reads == 0 {
            self.token.cancel();
        }
        Ok(n)
    }
}

/// Runs the blocking race on a plain thread, outside the test's async runtime.
async fn race_source<R>(
    url: String,
    row_hint: u64,
    config: RelayConfig,
    file: R,
    token: CancellationToken,
) -> lib::Result<RaceOutcome>
where
    R: Read + Send + 'static,
{
    let handle = thread::spawn(move || -> lib::Result<RaceOutcome> {
        let source = CancelableStream::new(file, token.clone());
        let racer = Racer::new(config)?;
        let outcome = TransformPipeline::new(source.clone(), "racer-test.csv.gz", 0.0)
            .and_then(|pipeline| racer.race(&url, row_hint, pipeline, &token));
        source.teardown();
        outcome
    });
    tokio::task::spawn_blocking(move || handle.join().unwrap())
        .await
        .unwrap()
}

async fn race(
    url: String,
    row_hint: u64,
    config: RelayConfig,
    text: String,
    token: CancellationToken,
) -> lib::Result<RaceOutcome> {
    race_source(url, row_hint, config, Cursor::new(gzip(&text)), token).await
}

/// A source that cancels `token` a few reads into a dataset far larger than those reads.
fn canceled_mid_stream(token: &CancellationToken) -> CancelAfter<Cursor<Vec<u8>>> {
    CancelAfter {
        inner: Cursor::new(gzip(&station_rows(200_000))),
        reads: 3,
        token: token.clone(),
    }
}

fn expected_document(text: &str) -> Vec<u8> {
    let mut out = Vec::new();
    TransformPipeline::new(Cursor::new(gzip(text)), "expected", 0.0)
        .unwrap()
        .read_to_end(&mut out)
        .unwrap();
    out
}

#[tokio::test]
async fn small_dataset_is_streamed_uncompressed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/1brc"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"racerId":"r1","raceId":"race-7","time":1.5}"#),
        )
        .expect(1)
        .mount(&server)
        .await;

    let text = station_rows(2_000);
    let outcome = race(
        racer_url(&server.uri()),
        1_000_000,
        RelayConfig::default(),
        text.clone(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let response = outcome.racer_response().unwrap();
    assert_eq!(response.race_id, "race-7");

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].headers.get("content-encoding").is_none());
    assert_eq!(requests[0].body, expected_document(&text));

    let doc: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(doc.as_array().unwrap().len(), 2_000);
}

#[tokio::test]
async fn large_dataset_is_gzipped_on_the_fly() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/1brc"))
        .and(header("content-encoding", "gzip"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let text = station_rows(20_000);
    let outcome = race(
        racer_url(&server.uri()),
        1_000_000_000,
        RelayConfig::default(),
        text.clone(),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert!(outcome.status.is_success());

    let requests = server.received_requests().await.unwrap();
    let mut body = Vec::new();
    GzDecoder::new(requests[0].body.as_slice())
        .read_to_end(&mut body)
        .unwrap();
    assert_eq!(body, expected_document(&text));
}

#[tokio::test]
async fn non_success_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let result = race(
        racer_url(&server.uri()),
        1_000_000,
        RelayConfig::default(),
        station_rows(10),
        CancellationToken::new(),
    )
    .await;
    assert!(matches!(result, Err(PipelineError::Status(503))));
}

#[tokio::test]
async fn malformed_row_fails_the_compressed_race() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let config = RelayConfig {
        compression: CompressionMode::Always,
        ..RelayConfig::default()
    };
    let text = format!("{}Broken,n/a\n", station_rows(100));
    let result = race(
        racer_url(&server.uri()),
        100,
        config,
        text,
        CancellationToken::new(),
    )
    .await;
    assert!(matches!(result, Err(PipelineError::Relay { .. })));
}

#[tokio::test]
async fn canceled_source_never_reaches_the_racer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let token = CancellationToken::new();
    token.cancel();
    let result = race(
        racer_url(&server.uri()),
        1_000_000,
        RelayConfig::default(),
        station_rows(10),
        token,
    )
    .await;
    assert!(matches!(result, Err(PipelineError::Canceled)));
}

#[tokio::test]
async fn cancel_mid_stream_stops_the_plain_race() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let token = CancellationToken::new();
    let result = race_source(
        racer_url(&server.uri()),
        200_000,
        RelayConfig::default(),
        canceled_mid_stream(&token),
        token.clone(),
    )
    .await;
    assert!(token.is_cancelled());
    assert!(matches!(result, Err(PipelineError::Canceled)), "{result:?}");
}

#[tokio::test]
async fn cancel_mid_stream_stops_the_compressed_race() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let token = CancellationToken::new();
    let result = race_source(
        racer_url(&server.uri()),
        1_000_000_000,
        RelayConfig::default(),
        canceled_mid_stream(&token),
        token.clone(),
    )
    .await;
    assert!(token.is_cancelled());
    assert!(matches!(result, Err(PipelineError::Canceled)), "{result:?}");
}

#[tokio::test]
async fn cancel_while_racer_is_still_answering() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(6)))
        .mount(&server)
        .await;

    let token = CancellationToken::new();
    let timer = token.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(500));
        timer.cancel();
    });

    let start = Instant::now();
    let result = race(
        racer_url(&server.uri()),
        1,
        RelayConfig::default(),
        station_rows(1),
        token,
    )
    .await;
    assert!(matches!(result, Err(PipelineError::Canceled)), "{result:?}");
    assert!(start.elapsed() < Duration::from_secs(3), "{:?}", start.elapsed());
}
