//! Broker transport seam and its rumqttc-backed implementation.

use super::TransportError;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions, QoS,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Connect-time parameters for one broker session.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    /// Static access token, presented as the MQTT username.
    pub access_token: String,
    pub keep_alive: Duration,
}

/// Asynchronous outcome reported by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Resolved(Result<SocketAddr, TransportError>),
    Accepted,
    Rejected(String),
    Dropped(String),
    Message { topic: String, payload: Bytes },
}

/// Operations the supervisor needs from the network. Every call returns
/// promptly; completions surface later through [`BrokerLink::poll_event`].
pub trait BrokerLink: Send {
    /// Start resolving `host`; the answer arrives as [`LinkEvent::Resolved`].
    fn resolve(&mut self, host: &str, port: u16);
    /// Begin a connection attempt; the outcome arrives as `Accepted`/`Rejected`.
    fn connect(&mut self, addr: SocketAddr, options: &ConnectOptions) -> Result<(), TransportError>;
    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;
    fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), TransportError>;
    fn poll_event(&mut self) -> Option<LinkEvent>;
}

/// Events from driver tasks carry the attempt generation so a superseded
/// connection cannot report into the current one. Resolution is untagged.
type Tagged = (Option<u64>, LinkEvent);

/// MQTT transport: each attempt gets a fresh client and event loop, driven by a
/// task that exits on the first error. Retry timing stays with the supervisor.
pub struct MqttLink {
    events_tx: mpsc::UnboundedSender<Tagged>,
    events_rx: mpsc::UnboundedReceiver<Tagged>,
    client: Option<AsyncClient>,
    driver: Option<JoinHandle<()>>,
    generation: u64,
    request_capacity: usize,
}

impl MqttLink {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            events_tx,
            events_rx,
            client: None,
            driver: None,
            generation: 0,
            request_capacity: 16,
        }
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        self.client.as_ref().ok_or(TransportError::NotConnected)
    }

    fn teardown(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        self.client = None;
    }
}

impl Default for MqttLink {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl BrokerLink for MqttLink {
    fn resolve(&mut self, host: &str, port: u16) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            let _ = self
                .events_tx
                .send((None, LinkEvent::Resolved(Err(TransportError::NoRuntime))));
            return;
        };
        let host = host.to_string();
        let tx = self.events_tx.clone();
        handle.spawn(async move {
            let result = match tokio::net::lookup_host((host.as_str(), port)).await {
                Ok(mut addrs) => addrs
                    .next()
                    .ok_or_else(|| TransportError::Resolve(format!("{host}: no addresses"))),
                Err(err) => Err(TransportError::Resolve(format!("{host}: {err}"))),
            };
            let _ = tx.send((None, LinkEvent::Resolved(result)));
        });
    }

    fn connect(&mut self, addr: SocketAddr, options: &ConnectOptions) -> Result<(), TransportError> {
        let handle =
            tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        self.teardown();
        self.generation = self.generation.wrapping_add(1);

        let mut mqtt = MqttOptions::new(options.client_id.clone(), addr.ip().to_string(), addr.port());
        mqtt.set_keep_alive(options.keep_alive);
        mqtt.set_clean_session(true);
        mqtt.set_credentials(options.access_token.clone(), String::new());

        let (client, eventloop) = AsyncClient::new(mqtt, self.request_capacity);
        let generation = self.generation;
        let tx = self.events_tx.clone();
        self.driver = Some(handle.spawn(drive(eventloop, generation, tx)));
        self.client = Some(client);
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client()?
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|err| TransportError::Client(err.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        self.client()?
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|err| TransportError::Client(err.to_string()))
    }

    fn poll_event(&mut self) -> Option<LinkEvent> {
        loop {
            let (generation, event) = self.events_rx.try_recv().ok()?;
            match generation {
                Some(g) if g != self.generation => continue,
                Some(_) if matches!(event, LinkEvent::Rejected(_) | LinkEvent::Dropped(_)) => {
                    self.driver = None;
                    self.client = None;
                    return Some(event);
                }
                _ => return Some(event),
            }
        }
    }
}

async fn drive(mut eventloop: EventLoop, generation: u64, tx: mpsc::UnboundedSender<Tagged>) {
    let tag = Some(generation);
    let mut accepted = false;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    accepted = true;
                    let _ = tx.send((tag, LinkEvent::Accepted));
                } else {
                    let _ = tx.send((tag, LinkEvent::Rejected(format!("{:?}", ack.code))));
                    return;
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let _ = tx.send((
                    tag,
                    LinkEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload,
                    },
                ));
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                let _ = tx.send((tag, LinkEvent::Rejected(format!("{code:?}"))));
                return;
            }
            Err(err) => {
                let event = if accepted {
                    LinkEvent::Dropped(err.to_string())
                } else {
                    LinkEvent::Rejected(err.to_string())
                };
                let _ = tx.send((tag, event));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
    const CONNACK_NOT_AUTHORIZED: [u8; 4] = [0x20, 0x02, 0x00, 0x05];

    fn options() -> ConnectOptions {
        ConnectOptions {
            client_id: "cubo-test".into(),
            access_token: "token".into(),
            keep_alive: Duration::from_secs(30),
        }
    }

    async fn next_event(link: &mut MqttLink) -> LinkEvent {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(event) = link.poll_event() {
                return event;
            }
            assert!(Instant::now() < deadline, "no link event within 5s");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn read_connect(stream: &mut TcpStream) {
        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0);
        assert_eq!(buf[0] >> 4, 1, "first packet is CONNECT");
    }

    #[tokio::test]
    async fn closed_socket_before_connack_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut link = MqttLink::new();
        link.connect(addr, &options()).unwrap();
        assert!(matches!(next_event(&mut link).await, LinkEvent::Rejected(_)));
        assert_eq!(
            link.publish("v1/devices/me/telemetry", Bytes::from_static(b"{}")),
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn refused_connack_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_connect(&mut stream).await;
            stream.write_all(&CONNACK_NOT_AUTHORIZED).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let mut link = MqttLink::new();
        link.connect(addr, &options()).unwrap();
        assert!(matches!(next_event(&mut link).await, LinkEvent::Rejected(_)));
    }

    #[tokio::test]
    async fn accepted_then_closed_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_connect(&mut stream).await;
            stream.write_all(&CONNACK_ACCEPTED).await.unwrap();
            let _ = close_rx.await;
        });

        let mut link = MqttLink::new();
        link.connect(addr, &options()).unwrap();
        assert_eq!(next_event(&mut link).await, LinkEvent::Accepted);
        assert!(link.subscribe("v1/devices/me/attributes").is_ok());

        close_tx.send(()).unwrap();
        assert!(matches!(next_event(&mut link).await, LinkEvent::Dropped(_)));
        assert_eq!(
            link.subscribe("v1/devices/me/attributes"),
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn superseded_attempt_cannot_report() {
        let closing = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closing_addr = closing.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = closing.accept().await.unwrap();
            drop(stream);
        });
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = silent.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = silent.accept().await.unwrap();
            read_connect(&mut stream).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut link = MqttLink::new();
        link.connect(closing_addr, &options()).unwrap();
        // Let the first attempt fail and queue its outcome unread.
        tokio::time::sleep(Duration::from_millis(300)).await;
        link.connect(silent_addr, &options()).unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(link.poll_event(), None);
        assert!(link
            .publish("v1/devices/me/telemetry", Bytes::from_static(b"{}"))
            .is_ok());
    }
}
