use super::link::{BrokerLink, ConnectOptions, LinkEvent};
use super::{TransportError, ATTR_RESPONSE_WILDCARD, ATTR_UPDATES_TOPIC};
use crate::config::{BrokerConfig, DeviceConfig};
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Connection bookkeeping owned by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteSession {
    pub state: ConnectionState,
    pub backoff: Duration,
    /// `None` means the next attempt may start immediately.
    pub next_retry_at: Option<Instant>,
    pub last_resolve_at: Option<Instant>,
}

/// Static parameters of the supervised connection.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub host: String,
    pub port: u16,
    pub connect: ConnectOptions,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub resolve_refresh: Duration,
    pub subscriptions: Vec<String>,
}

impl SupervisorSettings {
    pub fn from_config(device: &DeviceConfig, broker: &BrokerConfig) -> Self {
        Self {
            host: broker.host.clone(),
            port: broker.port,
            connect: ConnectOptions {
                client_id: device.client_id.clone(),
                access_token: broker.access_token.clone(),
                keep_alive: broker.keep_alive(),
            },
            min_backoff: broker.reconnect_min(),
            max_backoff: broker.reconnect_max(),
            resolve_refresh: broker.resolve_refresh(),
            subscriptions: vec![ATTR_UPDATES_TOPIC.into(), ATTR_RESPONSE_WILDCARD.into()],
        }
    }
}

/// What a tick observed, for the owner to fan out.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Connected,
    Disconnected,
    Message { topic: String, payload: Bytes },
}

/// Drives the broker connection: cached resolution, attempts, exponential
/// backoff and subscribe-on-connect. Never gives up.
pub struct ConnectionSupervisor<L: BrokerLink> {
    link: L,
    settings: SupervisorSettings,
    session: RemoteSession,
    remote_addr: Option<SocketAddr>,
    attempts: u64,
}

impl<L: BrokerLink> ConnectionSupervisor<L> {
    pub fn new(link: L, settings: SupervisorSettings) -> Self {
        let session = RemoteSession {
            state: ConnectionState::Disconnected,
            backoff: settings.min_backoff,
            next_retry_at: None,
            last_resolve_at: None,
        };
        Self {
            link,
            settings,
            session,
            remote_addr: None,
            attempts: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.state == ConnectionState::Connected
    }

    pub fn session(&self) -> RemoteSession {
        self.session
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Drain transport events, then start an attempt if one is due.
    pub fn tick(&mut self, now: Instant) -> Vec<SupervisorEvent> {
        let mut out = Vec::new();
        while let Some(event) = self.link.poll_event() {
            self.handle(event, now, &mut out);
        }
        if self.session.state == ConnectionState::Disconnected
            && self.session.next_retry_at.map_or(true, |at| now >= at)
        {
            self.attempt(now);
        }
        out
    }

    /// Publish on the live connection; fails fast when not connected.
    pub fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.link.publish(topic, payload)
    }

    fn refresh_resolution(&mut self, now: Instant) {
        let due = match self.session.last_resolve_at {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.settings.resolve_refresh,
        };
        if due {
            self.session.last_resolve_at = Some(now);
            tracing::debug!(host = %self.settings.host, "resolving broker address");
            self.link.resolve(&self.settings.host, self.settings.port);
        }
    }

    fn attempt(&mut self, now: Instant) {
        self.refresh_resolution(now);
        self.attempts = self.attempts.saturating_add(1);
        let Some(addr) = self.remote_addr else {
            self.fail(now, &TransportError::Unresolved);
            return;
        };
        tracing::info!(%addr, attempt = self.attempts, "connecting to broker");
        match self.link.connect(addr, &self.settings.connect) {
            Ok(()) => self.session.state = ConnectionState::Connecting,
            Err(err) => self.fail(now, &err),
        }
    }

    fn fail(&mut self, now: Instant, reason: &dyn std::fmt::Display) {
        self.session.state = ConnectionState::Disconnected;
        self.session.next_retry_at = Some(now + self.session.backoff);
        tracing::warn!(
            retry_in_ms = self.session.backoff.as_millis() as u64,
            "broker connection failed: {reason}"
        );
        self.session.backoff = self
            .session
            .backoff
            .saturating_mul(2)
            .clamp(self.settings.min_backoff, self.settings.max_backoff);
    }

    fn handle(&mut self, event: LinkEvent, now: Instant, out: &mut Vec<SupervisorEvent>) {
        match event {
            LinkEvent::Resolved(Ok(addr)) => {
                if self.remote_addr != Some(addr) {
                    tracing::info!(host = %self.settings.host, %addr, "broker address resolved");
                }
                self.remote_addr = Some(addr);
            }
            LinkEvent::Resolved(Err(err)) => {
                tracing::warn!(host = %self.settings.host, "broker resolution failed: {err}");
            }
            LinkEvent::Accepted => {
                if self.session.state != ConnectionState::Connecting {
                    return;
                }
                self.session.state = ConnectionState::Connected;
                self.session.backoff = self.settings.min_backoff;
                self.session.next_retry_at = None;
                tracing::info!("broker connection accepted");
                for topic in &self.settings.subscriptions {
                    if let Err(err) = self.link.subscribe(topic) {
                        tracing::warn!(%topic, "subscribe failed: {err}");
                    }
                }
                out.push(SupervisorEvent::Connected);
            }
            LinkEvent::Rejected(reason) => {
                if self.session.state == ConnectionState::Connecting {
                    self.fail(now, &format!("rejected: {reason}"));
                }
            }
            LinkEvent::Dropped(reason) => match self.session.state {
                ConnectionState::Connected => {
                    self.fail(now, &format!("dropped: {reason}"));
                    out.push(SupervisorEvent::Disconnected);
                }
                ConnectionState::Connecting => self.fail(now, &format!("dropped: {reason}")),
                ConnectionState::Disconnected => {}
            },
            LinkEvent::Message { topic, payload } => {
                if self.is_connected() {
                    out.push(SupervisorEvent::Message { topic, payload });
                }
            }
        }
    }
}
