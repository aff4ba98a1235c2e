//! Local event reporter.
//!
//! Game logic calls into [`SessionTracker`]; accepted records land in the
//! bounded [`EventQueue`] and a single task drains it through
//! [`DatagramSender`] to the local collector. Nothing here waits on the
//! broker connection.
//!
//! - `queue` - bounded FIFO with oldest-first eviction
//! - `datagram` - UDP sender and its consumer task
//! - `session` - session guards and record shapes
//! - `identity` - operator override and active-user resolution

pub mod datagram;
pub mod identity;
pub mod queue;
pub mod session;

pub use datagram::{spawn_sender, DatagramSender};
pub use identity::{parse_user_command, Identity};
pub use queue::EventQueue;
pub use session::{AmbientSource, EventRecord, LocalSession, SessionTracker, Silence, SoundSample};

use crate::config::CollectorConfig;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Upper bound for one serialized record / datagram.
pub const MAX_RECORD_BYTES: usize = 256;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("local reporter initialization failed: {0}")]
    Initialization(String),
}

/// Session operation refused by the open/closed guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionGuardViolation {
    #[error("session {session} already open")]
    AlreadyOpen { session: u32 },
    #[error("no open session")]
    NotOpen,
}

/// Cut `payload` to at most `max` bytes. Text payloads are cut on a UTF-8
/// boundary; the result is not re-validated as JSON.
pub fn truncate_payload(payload: &[u8], max: usize) -> &[u8] {
    if payload.len() <= max {
        return payload;
    }
    let mut end = max;
    if std::str::from_utf8(payload).is_ok() {
        while end > 0 && (payload[end] & 0b1100_0000) == 0b1000_0000 {
            end -= 1;
        }
    }
    &payload[..end]
}

/// Running reporter: the queue producers write to and the consumer task.
#[derive(Debug)]
pub struct Reporter {
    pub queue: EventQueue,
    pub task: JoinHandle<()>,
}

impl Reporter {
    /// Allocate the queue, bind the socket and spawn the sender.
    pub async fn start(
        config: &CollectorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, ReportError> {
        let dest: SocketAddr = config.addr.parse().map_err(|err| {
            ReportError::Initialization(format!("collector addr {}: {err}", config.addr))
        })?;
        let bind: SocketAddr = config.bind.parse().map_err(|err| {
            ReportError::Initialization(format!("collector bind {}: {err}", config.bind))
        })?;
        let queue = EventQueue::new(config.queue_capacity)?;
        let sender = DatagramSender::bind(bind, dest).await?;
        let task = spawn_sender(queue.clone(), sender, shutdown);
        Ok(Self { queue, task })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "aé".repeat(10);
        assert_eq!(truncate_payload(text.as_bytes(), 2), "a".as_bytes());
        assert_eq!(truncate_payload(text.as_bytes(), 5), "aéa".as_bytes());
        assert!(std::str::from_utf8(truncate_payload(text.as_bytes(), 7)).is_ok());
    }

    #[test]
    fn short_payloads_pass_through() {
        assert_eq!(truncate_payload(b"{}", MAX_RECORD_BYTES), b"{}");
    }
}
