//! HTTP transfer probe: GET for download, POST for upload.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::StreamExt;
use rand::RngCore;
use reqwest::{header, Client, Url};
use tracing::debug;

use super::{Direction, EventSink, ThroughputError, TransferProbe, TransferRequest};

/// Upload size when the request does not specify one.
pub const DEFAULT_UPLOAD_BYTES: u64 = 2_000_000;

/// Largest upload payload; the whole payload is held in memory.
pub const MAX_UPLOAD_BYTES: u64 = 256 * 1024 * 1024;

const UPLOAD_CHUNK: usize = 64 * 1024;
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

pub struct HttpTransferProbe {
    client: Client,
}

impl HttpTransferProbe {
    pub fn new(timeout: Duration) -> Result<Self, ThroughputError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ThroughputError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

impl TransferProbe for HttpTransferProbe {
    fn start_transfer(&self, request: TransferRequest, sink: EventSink) -> Result<(), ThroughputError> {
        let url = Url::parse(&request.url).map_err(|e| ThroughputError::InvalidUrl {
            url: request.url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ThroughputError::InvalidUrl {
                url: request.url,
                reason: format!("unsupported scheme {:?}", url.scheme()),
            });
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ThroughputError::Unavailable(e.to_string()))?;

        let client = self.client.clone();
        runtime.spawn(async move {
            let transfer = async {
                match request.direction {
                    Direction::Download => download(&client, url, &sink).await,
                    Direction::Upload => upload(&client, url, upload_size(request.payload_size), &sink).await,
                }
            };
            let result = tokio::select! {
                _ = sink.cancelled() => {
                    debug!(direction = %sink.direction(), attempt = sink.attempt(), "transfer abandoned");
                    return;
                }
                result = transfer => result,
            };
            match result {
                Ok(bits_per_sec) => sink.complete(bits_per_sec),
                Err(e) => sink.error(format!("{:#}", e)),
            }
        });

        Ok(())
    }
}

async fn download(client: &Client, url: Url, sink: &EventSink) -> Result<f64> {
    let start = Instant::now();
    let response = client
        .get(url)
        .send()
        .await
        .context("download request failed")?
        .error_for_status()
        .context("download rejected")?;

    let total = response.content_length();
    let mut stream = response.bytes_stream();
    let mut received: u64 = 0;
    let mut last_report = Instant::now();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("download stream interrupted")?;
        received += chunk.len() as u64;

        if last_report.elapsed() >= PROGRESS_INTERVAL {
            if let Some(total) = total.filter(|t| *t > 0) {
                sink.progress(percent(received, total));
            }
            last_report = Instant::now();
        }
    }

    if received == 0 {
        anyhow::bail!("download returned an empty body");
    }

    let secs = start.elapsed().as_secs_f64();
    debug!(received, secs, "download body drained");
    Ok(rate(received, secs))
}

async fn upload(client: &Client, url: Url, size: u64, sink: &EventSink) -> Result<f64> {
    let payload = random_payload(size);
    let chunks: Vec<Bytes> = (0..payload.len())
        .step_by(UPLOAD_CHUNK)
        .map(|offset| payload.slice(offset..(offset + UPLOAD_CHUNK).min(payload.len())))
        .collect();

    let progress = sink.clone();
    let mut sent: u64 = 0;
    let body = futures::stream::iter(chunks).map(move |chunk| {
        sent += chunk.len() as u64;
        progress.progress(percent(sent, size));
        Ok::<Bytes, std::io::Error>(chunk)
    });

    let start = Instant::now();
    client
        .post(url)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, size)
        .body(reqwest::Body::wrap_stream(body))
        .send()
        .await
        .context("upload request failed")?
        .error_for_status()
        .context("upload rejected")?;

    let secs = start.elapsed().as_secs_f64();
    debug!(size, secs, "upload acknowledged");
    Ok(rate(size, secs))
}

fn upload_size(requested: Option<u64>) -> u64 {
    requested.unwrap_or(DEFAULT_UPLOAD_BYTES).min(MAX_UPLOAD_BYTES)
}

fn random_payload(size: u64) -> Bytes {
    let mut buf = vec![0u8; size as usize];
    rand::thread_rng().fill_bytes(&mut buf);
    Bytes::from(buf)
}

fn percent(done: u64, total: u64) -> f32 {
    ((done as f64 / total as f64) * 100.0).min(100.0) as f32
}

fn rate(bytes: u64, secs: f64) -> f64 {
    (bytes as f64 * 8.0) / secs.max(f64::EPSILON)
}
