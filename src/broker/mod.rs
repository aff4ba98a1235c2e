//! Remote broker connectivity.
//!
//! [`ConnectionSupervisor`] owns the MQTT session and its retry policy,
//! [`AttributeSync`] keeps the `active_user` shared attribute, and
//! [`TelemetryPublisher`] pushes periodic state snapshots. [`Connectivity`]
//! bundles the three so a single task can tick them.
//!
//! - `link` - transport seam and the rumqttc implementation
//! - `supervisor` - connection state machine and backoff
//! - `attributes` - shared attribute request/cache
//! - `publisher` - periodic telemetry
//! - `testing` - scripted transport

pub mod attributes;
pub mod link;
pub mod publisher;
pub mod supervisor;
pub mod testing;

pub use attributes::{extract_quoted_value, AttributeSync, DeviceAttribute};
pub use link::{BrokerLink, ConnectOptions, LinkEvent, MqttLink};
pub use publisher::{SnapshotSource, TelemetryPublisher};
pub use supervisor::{
    ConnectionState, ConnectionSupervisor, RemoteSession, SupervisorEvent, SupervisorSettings,
};

use crate::config::Config;
use crate::time::Clock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

pub const ATTR_UPDATES_TOPIC: &str = "v1/devices/me/attributes";
pub const ATTR_RESPONSE_PREFIX: &str = "v1/devices/me/attributes/response/";
pub const ATTR_RESPONSE_WILDCARD: &str = "v1/devices/me/attributes/response/+";
pub const ATTR_REQUEST_TOPIC: &str = "v1/devices/me/attributes/request/1";
pub const TELEMETRY_TOPIC: &str = "v1/devices/me/telemetry";
pub const ACTIVE_USER_KEY: &str = "active_user";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("address resolution failed: {0}")]
    Resolve(String),
    #[error("broker address not resolved yet")]
    Unresolved,
    #[error("mqtt client error: {0}")]
    Client(String),
    #[error("not connected")]
    NotConnected,
    #[error("no async runtime available")]
    NoRuntime,
}

/// Whether an inbound topic carries shared attributes.
pub fn is_attribute_topic(topic: &str) -> bool {
    topic == ATTR_UPDATES_TOPIC || topic.starts_with(ATTR_RESPONSE_PREFIX)
}

/// Supervisor, attribute sync and publisher ticked together by one task.
pub struct Connectivity<L: BrokerLink> {
    supervisor: ConnectionSupervisor<L>,
    attributes: AttributeSync,
    publisher: TelemetryPublisher,
}

impl<L: BrokerLink> Connectivity<L> {
    /// `attributes` is built by the caller so identity readers can subscribe
    /// before the snapshot source exists.
    pub fn new(
        link: L,
        config: &Config,
        attributes: AttributeSync,
        source: Arc<dyn SnapshotSource>,
    ) -> Self {
        let broker = &config.broker;
        Self {
            supervisor: ConnectionSupervisor::new(
                link,
                SupervisorSettings::from_config(&config.device, broker),
            ),
            attributes,
            publisher: TelemetryPublisher::new(
                broker.telemetry_topic.clone(),
                broker.publish_period(),
                broker.publish_error_window(),
                source,
            ),
        }
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor<L> {
        &self.supervisor
    }

    pub fn supervisor_mut(&mut self) -> &mut ConnectionSupervisor<L> {
        &mut self.supervisor
    }

    pub fn attributes(&self) -> &AttributeSync {
        &self.attributes
    }

    pub fn publisher(&self) -> &TelemetryPublisher {
        &self.publisher
    }

    /// Receiver for the cached `active_user` attribute.
    pub fn attribute_feed(&self) -> watch::Receiver<DeviceAttribute> {
        self.attributes.subscribe()
    }

    pub fn tick(&mut self, now: Instant) -> Vec<SupervisorEvent> {
        let events = self.supervisor.tick(now);
        for event in &events {
            match event {
                SupervisorEvent::Connected => {
                    self.attributes.on_connected();
                    self.attributes.request(now, &mut self.supervisor);
                }
                SupervisorEvent::Disconnected => {
                    tracing::info!("broker connection lost; telemetry paused");
                }
                SupervisorEvent::Message { topic, payload } => {
                    if is_attribute_topic(topic) {
                        self.attributes.on_update(payload);
                    } else {
                        tracing::debug!(%topic, "ignoring message on unexpected topic");
                    }
                }
            }
        }
        self.attributes.tick(now, &mut self.supervisor);
        self.publisher.tick(now, &mut self.supervisor);
        events
    }

    /// Tick on a fixed period until shutdown is signalled.
    pub async fn run<C: Clock>(
        mut self,
        clock: C,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(clock.now());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!(attempts = self.supervisor.attempts(), "connectivity loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_topics_are_recognized() {
        assert!(is_attribute_topic(ATTR_UPDATES_TOPIC));
        assert!(is_attribute_topic("v1/devices/me/attributes/response/1"));
        assert!(!is_attribute_topic(TELEMETRY_TOPIC));
        assert!(!is_attribute_topic("v1/devices/me/attributes/request/1"));
    }
}
