//! Graphite metrics publication.
//!
//! Senders push `(path, value)` samples into a bounded queue; a background
//! task owns the TCP connection and writes the plaintext protocol. The queue
//! absorbs momentary spikes only; when it is full, or while the Graphite
//! server is unreachable, samples are dropped.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const QUEUE_SIZE: usize = 500;
const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// Handle to the metrics pipeline. Cheap to clone; a disabled handle
/// swallows everything.
#[derive(Clone)]
pub struct Graphite {
    tx: Option<mpsc::Sender<Sample>>,
}

struct Sample {
    path: String,
    value: f64,
    t: u64,
}

impl Graphite {
    /// No-op pipeline for deployments without a Graphite server.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Spawn the writer task connecting to `addr` (`host:port`).
    pub fn spawn(addr: String) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_SIZE);

        tokio::spawn(write_samples(addr, rx));

        Self { tx: Some(tx) }
    }

    /// A sender publishing under `aprs2.{node}.`.
    pub fn sender(&self, node: &str) -> Sender {
        Sender {
            tx: self.tx.clone(),
            prefix: format!("aprs2.{node}"),
        }
    }
}

#[derive(Clone)]
pub struct Sender {
    tx: Option<mpsc::Sender<Sample>>,
    prefix: String,
}

impl Sender {
    pub fn send(&self, metric: &str, value: f64) {
        let Some(tx) = &self.tx else {
            return;
        };

        let sample = Sample {
            path: format!("{}.{metric}", self.prefix),
            value,
            t: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };

        if tx.try_send(sample).is_err() {
            tracing::debug!(prefix = %self.prefix, %metric, "Metrics queue full, dropping sample");
        }
    }
}

async fn write_samples(addr: String, mut rx: mpsc::Receiver<Sample>) {
    let mut conn: Option<TcpStream> = None;
    let mut last_attempt: Option<Instant> = None;

    while let Some(sample) = rx.recv().await {
        if conn.is_none() {
            // Don't hammer a dead server; drop samples between attempts.
            if last_attempt.is_some_and(|t| t.elapsed() < RECONNECT_INTERVAL) {
                continue;
            }
            last_attempt = Some(Instant::now());

            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    tracing::info!(%addr, "Connected to Graphite");
                    conn = Some(stream);
                }
                Err(e) => {
                    tracing::warn!(%addr, "Failed to connect to Graphite: {e}");
                    continue;
                }
            }
        }

        let line = format!("{} {} {}\n", sample.path, sample.value, sample.t);
        if let Some(stream) = conn.as_mut()
            && let Err(e) = stream.write_all(line.as_bytes()).await
        {
            tracing::warn!(%addr, "Graphite send failed: {e}");
            conn = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn disabled_sender_swallows_samples() {
        let sender = Graphite::disabled().sender("server.T2TEST");
        sender.send("merged_ok", 1.0);
    }

    #[tokio::test]
    async fn samples_arrive_as_plaintext_lines() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let graphite = Graphite::spawn(addr.to_string());
        let sender = graphite.sender("server.T2TEST");
        sender.send("merged_ok", 1.0);
        sender.send("score", 17.5);

        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        while buf.iter().filter(|b| **b == b'\n').count() < 2 {
            let mut chunk = [0u8; 256];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed early");
            buf.extend_from_slice(&chunk[..n]);
        }

        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("aprs2.server.T2TEST.merged_ok 1 "));
        assert!(lines.next().unwrap().starts_with("aprs2.server.T2TEST.score 17.5 "));
    }
}
