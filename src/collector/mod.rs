//! Receiving side of the local event stream.
//!
//! Runs on the operator's machine: every datagram becomes one annotated JSON
//! line in an append-only log, which [`summary`] later folds into per-session
//! results.

pub mod summary;

pub use summary::{load_events, summarize, SessionSummary};

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio::sync::watch;

const RECV_BUFFER_BYTES: usize = 2048;

/// Wall-clock stamp written as `dt` on each logged record.
pub fn local_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Turn one datagram into a log entry. Non-JSON (or non-object) payloads are
/// kept under `raw`; blank payloads yield `None`.
pub fn annotate(datagram: &[u8], src: SocketAddr, dt: &str) -> Option<Map<String, Value>> {
    let text = String::from_utf8_lossy(datagram);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let mut entry = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => map,
        _ => {
            let mut map = Map::new();
            map.insert("raw".into(), Value::String(text.to_string()));
            map
        }
    };
    entry.insert("dt".into(), Value::String(dt.to_string()));
    entry.insert("src_ip".into(), Value::String(src.ip().to_string()));
    entry.insert("src_port".into(), Value::from(src.port()));
    Some(entry)
}

/// Append-only JSON Lines file.
pub struct JsonlLog {
    path: PathBuf,
    file: File,
}

impl JsonlLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening event log {}", path.display()))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&mut self, entry: &Map<String, Value>) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.file.write_all(&line).await?;
        self.file.flush().await?;
        Ok(())
    }
}

/// UDP listener writing every received record to a [`JsonlLog`].
pub struct Collector {
    socket: UdpSocket,
    log: JsonlLog,
    received: u64,
}

impl Collector {
    pub async fn bind(addr: SocketAddr, out: impl AsRef<Path>) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("binding collector socket {addr}"))?;
        let log = JsonlLog::open(out).await?;
        tracing::info!(
            addr = %socket.local_addr()?,
            out = %log.path().display(),
            "collector listening"
        );
        Ok(Self {
            socket,
            log,
            received: 0,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Wait for one datagram and log it. Returns the stored entry, or `None`
    /// when the datagram was blank.
    pub async fn receive_one(&mut self) -> Result<Option<Map<String, Value>>> {
        let mut buf = [0u8; RECV_BUFFER_BYTES];
        let (len, src) = self.socket.recv_from(&mut buf).await?;
        self.record(&buf[..len], src).await
    }

    async fn record(
        &mut self,
        datagram: &[u8],
        src: SocketAddr,
    ) -> Result<Option<Map<String, Value>>> {
        let Some(entry) = annotate(datagram, src, &local_timestamp()) else {
            return Ok(None);
        };
        self.log.append(&entry).await?;
        self.received += 1;

        let field = |key: &str| entry.get(key).map(display_value).unwrap_or_default();
        let event = entry
            .get("event")
            .or_else(|| entry.get("raw"))
            .map_or_else(|| "?".to_string(), display_value);
        tracing::info!(
            src_ip = %src.ip(),
            ev = %event,
            user = %field("user"),
            session = %field("session"),
            modo = %field("modo"),
            "record received"
        );
        Ok(Some(entry))
    }

    /// Receive until shutdown. Per-datagram failures are logged and skipped.
    /// Only the socket wait races shutdown; a received datagram is always
    /// written in full.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<u64> {
        let mut buf = [0u8; RECV_BUFFER_BYTES];
        loop {
            let received = tokio::select! {
                received = self.socket.recv_from(&mut buf) => received,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            let result = match received {
                Ok((len, src)) => self.record(&buf[..len], src).await,
                Err(err) => Err(err.into()),
            };
            if let Err(err) = result {
                tracing::warn!("collector receive failed: {err:?}");
            }
        }
        tracing::info!(received = self.received, "collector stopped");
        Ok(self.received)
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
