//! In-memory [`BrokerLink`] driven by a script of events. Used by the unit and
//! integration tests and by `cubo simulate`.

use super::link::{BrokerLink, ConnectOptions, LinkEvent};
use super::TransportError;
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;

#[derive(Debug, Default)]
pub struct ScriptedLink {
    events: VecDeque<LinkEvent>,
    pub resolves: usize,
    pub connects: usize,
    /// Number of upcoming `connect` calls that fail synchronously.
    pub fail_connects: usize,
    /// Fail every publish with a client error.
    pub fail_publishes: bool,
    pub subscribed: Vec<String>,
    pub published: Vec<(String, Bytes)>,
    pub last_options: Option<ConnectOptions>,
}

impl ScriptedLink {
    /// Queue an event for the next `poll_event`.
    pub fn push(&mut self, event: LinkEvent) {
        self.events.push_back(event);
    }

    /// Payloads published on `topic`, oldest first.
    pub fn published_on(&self, topic: &str) -> Vec<Bytes> {
        self.published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

impl BrokerLink for ScriptedLink {
    fn resolve(&mut self, _host: &str, _port: u16) {
        self.resolves += 1;
    }

    fn connect(&mut self, _addr: SocketAddr, options: &ConnectOptions) -> Result<(), TransportError> {
        self.connects += 1;
        self.last_options = Some(options.clone());
        if self.fail_connects > 0 {
            self.fail_connects -= 1;
            return Err(TransportError::Client("connection refused".into()));
        }
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.subscribed.push(topic.to_string());
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        if self.fail_publishes {
            return Err(TransportError::Client("request queue full".into()));
        }
        self.published.push((topic.to_string(), payload));
        Ok(())
    }

    fn poll_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }
}
