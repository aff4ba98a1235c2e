use super::link::BrokerLink;
use super::supervisor::ConnectionSupervisor;
use crate::telemetry::LogThrottle;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Serializes current device state for the telemetry topic. An empty
/// result means there is nothing to publish this period.
pub trait SnapshotSource: Send + Sync {
    fn produce(&self) -> Bytes;
}

/// Publishes one snapshot per period while connected. Failures are dropped.
pub struct TelemetryPublisher {
    topic: String,
    period: Duration,
    source: Arc<dyn SnapshotSource>,
    last_publish: Option<Instant>,
    errors: LogThrottle,
    published: u64,
}

impl TelemetryPublisher {
    pub fn new(
        topic: impl Into<String>,
        period: Duration,
        error_window: Duration,
        source: Arc<dyn SnapshotSource>,
    ) -> Self {
        Self {
            topic: topic.into(),
            period,
            source,
            last_publish: None,
            errors: LogThrottle::new(error_window),
            published: 0,
        }
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    pub fn tick<L: BrokerLink>(&mut self, now: Instant, supervisor: &mut ConnectionSupervisor<L>) {
        if !supervisor.is_connected() {
            return;
        }
        if let Some(last) = self.last_publish {
            if now.saturating_duration_since(last) < self.period {
                return;
            }
        }
        self.last_publish = Some(now);

        let snapshot = self.source.produce();
        if snapshot.is_empty() {
            return;
        }
        match supervisor.publish(&self.topic, snapshot) {
            Ok(()) => self.published = self.published.saturating_add(1),
            Err(err) => {
                if let Some(suppressed) = self.errors.admit(now) {
                    tracing::warn!(topic = %self.topic, suppressed, "telemetry publish failed: {err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::link::LinkEvent;
    use crate::broker::supervisor::SupervisorSettings;
    use crate::broker::testing::ScriptedLink;
    use crate::broker::TELEMETRY_TOPIC;
    use crate::config::{BrokerConfig, DeviceConfig};
    use parking_lot::Mutex;

    struct Fixed(Mutex<Bytes>);

    impl SnapshotSource for Fixed {
        fn produce(&self) -> Bytes {
            self.0.lock().clone()
        }
    }

    fn publisher(payload: &'static [u8]) -> (TelemetryPublisher, Arc<Fixed>) {
        let source = Arc::new(Fixed(Mutex::new(Bytes::from_static(payload))));
        let publisher = TelemetryPublisher::new(
            TELEMETRY_TOPIC,
            Duration::from_secs(5),
            Duration::from_secs(2),
            source.clone(),
        );
        (publisher, source)
    }

    fn supervisor(now: Instant, connect: bool) -> ConnectionSupervisor<ScriptedLink> {
        let settings =
            SupervisorSettings::from_config(&DeviceConfig::default(), &BrokerConfig::default());
        let mut sup = ConnectionSupervisor::new(ScriptedLink::default(), settings);
        if connect {
            sup.link_mut()
                .push(LinkEvent::Resolved(Ok("10.0.0.1:1883".parse().unwrap())));
            sup.tick(now);
            sup.link_mut().push(LinkEvent::Accepted);
            sup.tick(now);
        }
        sup
    }

    #[test]
    fn publishes_once_per_period() {
        let t0 = Instant::now();
        let mut sup = supervisor(t0, true);
        let (mut publisher, _) = publisher(br#"{"estado":0}"#);
        publisher.tick(t0, &mut sup);
        publisher.tick(t0 + Duration::from_millis(4_999), &mut sup);
        assert_eq!(publisher.published(), 1);
        publisher.tick(t0 + Duration::from_millis(5_000), &mut sup);
        assert_eq!(publisher.published(), 2);
        assert_eq!(sup.link().published_on(TELEMETRY_TOPIC).len(), 2);
    }

    #[test]
    fn nothing_leaves_while_disconnected() {
        let t0 = Instant::now();
        let mut sup = supervisor(t0, false);
        let (mut publisher, _) = publisher(br#"{"estado":0}"#);
        for step in 0..20u64 {
            publisher.tick(t0 + Duration::from_secs(step), &mut sup);
        }
        assert_eq!(publisher.published(), 0);
        assert!(sup.link().published.is_empty());
    }

    #[test]
    fn empty_snapshot_is_skipped() {
        let t0 = Instant::now();
        let mut sup = supervisor(t0, true);
        let (mut publisher, source) = publisher(b"");
        publisher.tick(t0, &mut sup);
        assert!(sup.link().published.is_empty());

        *source.0.lock() = Bytes::from_static(br#"{"estado":1}"#);
        publisher.tick(t0 + Duration::from_secs(5), &mut sup);
        assert_eq!(publisher.published(), 1);
    }

    #[test]
    fn failures_are_swallowed() {
        let t0 = Instant::now();
        let mut sup = supervisor(t0, true);
        sup.link_mut().fail_publishes = true;
        let (mut publisher, _) = publisher(br#"{"estado":0}"#);
        for step in 0..4u64 {
            publisher.tick(t0 + Duration::from_secs(5 * step), &mut sup);
        }
        assert_eq!(publisher.published(), 0);
        assert!(sup.is_connected());
    }
}
