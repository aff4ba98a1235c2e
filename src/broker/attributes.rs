use super::link::BrokerLink;
use super::supervisor::ConnectionSupervisor;
use super::{ACTIVE_USER_KEY, ATTR_REQUEST_TOPIC};
use bytes::Bytes;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Longest attribute value accepted from the broker.
pub const ATTRIBUTE_VALUE_MAX_CHARS: usize = 15;

/// Cached shared attribute as last reported by the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceAttribute {
    pub value: String,
    pub known: bool,
}

impl DeviceAttribute {
    pub fn known(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            known: true,
        }
    }
}

/// Requests the `active_user` shared attribute and caches the answer.
///
/// Sole writer of the cached value; readers hold [`watch::Receiver`]s.
pub struct AttributeSync {
    tx: watch::Sender<DeviceAttribute>,
    retry: Duration,
    last_request: Option<Instant>,
    requests: u64,
}

impl AttributeSync {
    pub fn new(retry: Duration) -> Self {
        let (tx, _) = watch::channel(DeviceAttribute::default());
        Self {
            tx,
            retry,
            last_request: None,
            requests: 0,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceAttribute> {
        self.tx.subscribe()
    }

    pub fn get(&self) -> DeviceAttribute {
        self.tx.borrow().clone()
    }

    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// A fresh connection makes the next request due immediately.
    pub fn on_connected(&mut self) {
        self.last_request = None;
    }

    /// Ask the broker for the attribute. No-op unless connected.
    pub fn request<L: BrokerLink>(
        &mut self,
        now: Instant,
        supervisor: &mut ConnectionSupervisor<L>,
    ) -> bool {
        if !supervisor.is_connected() {
            return false;
        }
        self.last_request = Some(now);
        self.requests = self.requests.saturating_add(1);
        let payload = Bytes::from(format!("{{\"sharedKeys\":\"{ACTIVE_USER_KEY}\"}}"));
        match supervisor.publish(ATTR_REQUEST_TOPIC, payload) {
            Ok(()) => {
                tracing::debug!(topic = ATTR_REQUEST_TOPIC, "attribute request sent");
                true
            }
            Err(err) => {
                tracing::debug!(topic = ATTR_REQUEST_TOPIC, "attribute request failed: {err}");
                false
            }
        }
    }

    /// Re-issue the request on the retry interval while the value is unknown.
    pub fn tick<L: BrokerLink>(&mut self, now: Instant, supervisor: &mut ConnectionSupervisor<L>) {
        if self.tx.borrow().known || !supervisor.is_connected() {
            return;
        }
        let due = match self.last_request {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.retry,
        };
        if due {
            self.request(now, supervisor);
        }
    }

    /// Apply an inbound attribute payload. Returns whether the cache changed.
    pub fn on_update(&mut self, raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some(value) = extract_quoted_value(&text, ACTIVE_USER_KEY, ATTRIBUTE_VALUE_MAX_CHARS)
        else {
            return false;
        };
        tracing::info!(active_user = %value, "active user received from broker");
        self.tx.send_replace(DeviceAttribute::known(value));
        true
    }
}

/// Minimal field extractor: finds the literal `"key"`, the next `:`, and the
/// quoted string after it (cut at `max_chars`). Escaped quotes and nesting
/// are not understood; a value containing `"` is cut short.
pub fn extract_quoted_value(payload: &str, key: &str, max_chars: usize) -> Option<String> {
    let needle = format!("\"{key}\"");
    let at = payload.find(&needle)?;
    let after_key = &payload[at..];
    let colon = after_key.find(':')?;
    let rest = after_key[colon + 1..].trim_start_matches([' ', '\t']);
    let rest = rest.strip_prefix('"')?;
    let value: String = rest
        .chars()
        .take_while(|c| *c != '"')
        .take(max_chars)
        .collect();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::link::LinkEvent;
    use crate::broker::supervisor::SupervisorSettings;
    use crate::broker::testing::ScriptedLink;
    use crate::config::{BrokerConfig, DeviceConfig};

    fn connected_supervisor(now: Instant) -> ConnectionSupervisor<ScriptedLink> {
        let settings = SupervisorSettings::from_config(&DeviceConfig::default(), &BrokerConfig::default());
        let mut sup = ConnectionSupervisor::new(ScriptedLink::default(), settings);
        sup.link_mut()
            .push(LinkEvent::Resolved(Ok("10.0.0.1:1883".parse().unwrap())));
        sup.tick(now);
        sup.link_mut().push(LinkEvent::Accepted);
        sup.tick(now);
        assert!(sup.is_connected());
        sup
    }

    #[test]
    fn extractor_reads_response_shapes() {
        let max = ATTRIBUTE_VALUE_MAX_CHARS;
        assert_eq!(
            extract_quoted_value(r#"{"shared":{"active_user":"Davi"}}"#, "active_user", max).as_deref(),
            Some("Davi")
        );
        assert_eq!(
            extract_quoted_value(r#"{"active_user" :	"Ana"}"#, "active_user", max).as_deref(),
            Some("Ana")
        );
        assert_eq!(
            extract_quoted_value(r#"{"active_user":"Maximiliano Pereira"}"#, "active_user", max).as_deref(),
            Some("Maximiliano Per")
        );
        assert_eq!(extract_quoted_value(r#"{"Active_User":"Ana"}"#, "active_user", max), None);
        assert_eq!(extract_quoted_value(r#"{"active_user":""}"#, "active_user", max), None);
        assert_eq!(extract_quoted_value(r#"{"active_user":null}"#, "active_user", max), None);
        assert_eq!(extract_quoted_value(r#"{"active_user""#, "active_user", max), None);
    }

    #[test]
    fn request_echo_followed_by_value_resolves() {
        let mut sync = AttributeSync::new(Duration::from_secs(20));
        let payload = br#"{"sharedKeys":"active_user"}{"active_user":"Ana"}"#;
        assert!(sync.on_update(payload));
        assert_eq!(sync.get(), DeviceAttribute::known("Ana"));

        assert!(!sync.on_update(br#"{"other":"x"}"#));
        assert!(!sync.on_update(b"\xff\xfe garbage"));
        assert_eq!(sync.get(), DeviceAttribute::known("Ana"));
    }

    #[test]
    fn request_requires_connection() {
        let settings = SupervisorSettings::from_config(&DeviceConfig::default(), &BrokerConfig::default());
        let mut sup = ConnectionSupervisor::new(ScriptedLink::default(), settings);
        let mut sync = AttributeSync::new(Duration::from_secs(20));
        assert!(!sync.request(Instant::now(), &mut sup));
        assert!(sup.link().published.is_empty());
    }

    #[test]
    fn retries_on_interval_until_known() {
        let t0 = Instant::now();
        let mut sup = connected_supervisor(t0);
        let mut sync = AttributeSync::new(Duration::from_secs(20));
        sync.on_connected();
        sync.tick(t0, &mut sup);
        sync.tick(t0 + Duration::from_secs(5), &mut sup);
        assert_eq!(sync.requests(), 1);
        sync.tick(t0 + Duration::from_secs(20), &mut sup);
        assert_eq!(sync.requests(), 2);

        let (topic, payload) = sup.link().published.last().unwrap().clone();
        assert_eq!(topic, ATTR_REQUEST_TOPIC);
        assert_eq!(&payload[..], br#"{"sharedKeys":"active_user"}"#);

        sync.on_update(br#"{"active_user":"Bia"}"#);
        sync.tick(t0 + Duration::from_secs(60), &mut sup);
        assert_eq!(sync.requests(), 2);
    }

    #[test]
    fn repeated_requests_leave_cache_untouched() {
        let t0 = Instant::now();
        let mut sup = connected_supervisor(t0);
        let mut sync = AttributeSync::new(Duration::from_secs(20));
        for _ in 0..5 {
            sync.request(t0, &mut sup);
        }
        assert_eq!(sync.get(), DeviceAttribute::default());
    }
}
