use super::{truncate_payload, EventQueue, ReportError, MAX_RECORD_BYTES};
use crate::ops::LogThrottle;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const SEND_ERROR_WINDOW: Duration = Duration::from_secs(2);

/// Fire-and-forget UDP transmission to the fixed collector address.
#[derive(Debug)]
pub struct DatagramSender {
    socket: UdpSocket,
    dest: SocketAddr,
    errors: LogThrottle,
    sent: u64,
}

impl DatagramSender {
    pub async fn bind(bind: SocketAddr, dest: SocketAddr) -> Result<Self, ReportError> {
        let socket = UdpSocket::bind(bind).await.map_err(|err| {
            ReportError::Initialization(format!("udp bind {bind} failed: {err}"))
        })?;
        tracing::info!(%dest, "local report sender ready");
        Ok(Self {
            socket,
            dest,
            errors: LogThrottle::new(SEND_ERROR_WINDOW),
            sent: 0,
        })
    }

    pub fn destination(&self) -> SocketAddr {
        self.dest
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Send one record as a single datagram. Oversized payloads are cut to the
    /// record bound; errors are logged (throttled) and otherwise dropped.
    pub async fn send(&mut self, record: &[u8]) {
        if record.is_empty() {
            return;
        }
        let payload = truncate_payload(record, MAX_RECORD_BYTES);
        match self.socket.send_to(payload, self.dest).await {
            Ok(_) => self.sent = self.sent.saturating_add(1),
            Err(err) => {
                if let Some(suppressed) = self.errors.admit(Instant::now()) {
                    tracing::warn!(dest = %self.dest, suppressed, "local report send failed: {err}");
                }
            }
        }
    }
}

/// Spawn the queue consumer. It owns the sender and runs until shutdown.
pub fn spawn_sender(
    queue: EventQueue,
    mut sender: DatagramSender,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                record = queue.dequeue() => sender.send(&record).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(sent = sender.sent(), "local report sender stopped");
    })
}
