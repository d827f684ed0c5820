//! Broker Module
//!
//! Network-level pub/sub session. [`Broker`] is the seam the telemetry link
//! drives; [`MqttBroker`] implements it over MQTT.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BrokerAddress;

const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Parameters for one network session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client_id: String,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    pub clean_session: bool,
}

/// Asynchronous notifications from an open session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    ConnectionLost(String),
    Message { topic: String, payload: Vec<u8> },
}

/// A pub/sub session with at-least-once delivery.
///
/// `connect` resolves once the broker has accepted the session; afterwards
/// inbound messages and the loss of the session arrive on `events`.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(
        &self,
        options: &SessionOptions,
        events: mpsc::UnboundedSender<BrokerEvent>,
    ) -> Result<(), LinkError>;

    async fn subscribe(&self, topic: &str) -> Result<(), LinkError>;

    /// Publish at-least-once, not retained
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), LinkError>;

    async fn disconnect(&self) -> Result<(), LinkError>;

    fn is_connected(&self) -> bool;
}

struct MqttSession {
    client: AsyncClient,
    driver: JoinHandle<()>,
}

/// MQTT 3.1.1 broker session backed by rumqttc
pub struct MqttBroker {
    address: BrokerAddress,
    session: Mutex<Option<MqttSession>>,
    connected: Arc<AtomicBool>,
}

impl MqttBroker {
    pub fn new(address: BrokerAddress) -> Self {
        Self {
            address,
            session: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn client(&self) -> Result<AsyncClient, LinkError> {
        self.session
            .lock()
            .map_err(|_| LinkError::NotConnected)?
            .as_ref()
            .map(|s| s.client.clone())
            .ok_or(LinkError::NotConnected)
    }

    fn take_session(&self) -> Option<MqttSession> {
        self.session.lock().ok().and_then(|mut s| s.take())
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn connect(
        &self,
        options: &SessionOptions,
        events: mpsc::UnboundedSender<BrokerEvent>,
    ) -> Result<(), LinkError> {
        if let Some(stale) = self.take_session() {
            debug!("Dropping stale MQTT session");
            stale.driver.abort();
        }

        let mut mqtt_options =
            MqttOptions::new(&options.client_id, &self.address.host, self.address.port);
        mqtt_options.set_keep_alive(options.keep_alive);
        mqtt_options.set_clean_session(options.clean_session);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        // rumqttc applies its own connect deadline (5 s unless told otherwise)
        eventloop
            .network_options
            .set_connection_timeout(options.connect_timeout.as_secs().max(1));

        info!("Connecting to MQTT broker: {}", self.address);
        tokio::time::timeout(options.connect_timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| LinkError::Timeout(options.connect_timeout))??;

        self.connected.store(true, Ordering::Release);
        let driver = tokio::spawn(drive(eventloop, events, self.connected.clone()));

        if let Ok(mut session) = self.session.lock() {
            *session = Some(MqttSession { client, driver });
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), LinkError> {
        self.client()?
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| LinkError::Subscribe(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), LinkError> {
        self.client()?
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| LinkError::Publish(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.connected.store(false, Ordering::Release);
        let Some(session) = self.take_session() else {
            return Ok(());
        };

        let result = session
            .client
            .disconnect()
            .await
            .map_err(|e| LinkError::Disconnect(e.to_string()));

        // Let the driver flush the DISCONNECT packet, then stop it regardless
        let abort = session.driver.abort_handle();
        if tokio::time::timeout(Duration::from_secs(1), session.driver)
            .await
            .is_err()
        {
            abort.abort();
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), LinkError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(LinkError::Refused(format!("{:?}", ack.code)))
                };
            }
            Ok(_) => continue,
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(LinkError::Refused(format!("{:?}", code)))
            }
            Err(e) => return Err(LinkError::Connect(e.to_string())),
        }
    }
}

/// Poll the event loop until the session drops, forwarding inbound publishes.
async fn drive(
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<BrokerEvent>,
    connected: Arc<AtomicBool>,
) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => BrokerEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            },
            Ok(Event::Incoming(Packet::Disconnect)) => {
                BrokerEvent::ConnectionLost("broker sent DISCONNECT".into())
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                debug!("Message {} delivered", ack.pkid);
                continue;
            }
            Ok(_) => continue,
            Err(e) => BrokerEvent::ConnectionLost(e.to_string()),
        };

        let lost = matches!(event, BrokerEvent::ConnectionLost(_));
        if lost {
            connected.store(false, Ordering::Release);
            warn!("MQTT session ended");
        }
        if events.send(event).is_err() || lost {
            break;
        }
    }
}

/// Telemetry link errors
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Connection refused by broker: {0}")]
    Refused(String),

    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Disconnect failed: {0}")]
    Disconnect(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::Instant;

    const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
    const CONNACK_NOT_AUTHORIZED: [u8; 4] = [0x20, 0x02, 0x00, 0x05];

    async fn listen() -> (TcpListener, MqttBroker) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let address = BrokerAddress::parse(&format!("tcp://127.0.0.1:{}", port)).unwrap();
        (listener, MqttBroker::new(address))
    }

    fn session(connect_timeout: Duration) -> SessionOptions {
        SessionOptions {
            client_id: "bus-test".into(),
            connect_timeout,
            keep_alive: Duration::from_secs(60),
            clean_session: true,
        }
    }

    /// One MQTT control packet: first header byte and the remaining bytes
    async fn read_packet(socket: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let header = socket.read_u8().await.ok()?;
        let mut length = 0usize;
        let mut shift = 0;
        loop {
            let byte = socket.read_u8().await.ok()?;
            length |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; length];
        socket.read_exact(&mut body).await.ok()?;
        Some((header, body))
    }

    /// Length-prefixed UTF-8 string at `at`, and the offset just past it
    fn string_at(body: &[u8], at: usize) -> (String, usize) {
        let len = u16::from_be_bytes([body[at], body[at + 1]]) as usize;
        let end = at + 2 + len;
        (String::from_utf8(body[at + 2..end].to_vec()).unwrap(), end)
    }

    /// Answer CONNECT with `connack`, then report every packet received
    fn serve(
        listener: TcpListener,
        connack: [u8; 4],
    ) -> mpsc::UnboundedReceiver<(u8, Vec<u8>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            while let Some(packet) = read_packet(&mut socket).await {
                let is_connect = packet.0 == 0x10;
                let _ = tx.send(packet);
                if is_connect {
                    socket.write_all(&connack).await.unwrap();
                }
            }
        });
        rx
    }

    #[tokio::test]
    async fn session_options_reach_the_broker() {
        let (listener, broker) = listen().await;
        let mut packets = serve(listener, CONNACK_ACCEPTED);
        let (events, _events_rx) = mpsc::unbounded_channel();

        broker
            .connect(&session(Duration::from_secs(5)), events)
            .await
            .unwrap();
        assert!(broker.is_connected());

        let (header, connect) = packets.recv().await.unwrap();
        assert_eq!(header, 0x10);
        let (protocol, at) = string_at(&connect, 0);
        assert_eq!(protocol, "MQTT");
        assert_eq!(connect[at], 4);
        assert_ne!(connect[at + 1] & 0x02, 0, "clean session flag");
        assert_eq!(u16::from_be_bytes([connect[at + 2], connect[at + 3]]), 60);
        assert_eq!(string_at(&connect, at + 4).0, "bus-test");

        broker
            .publish("tracking/coordinates", b"{}".to_vec())
            .await
            .unwrap();
        let (header, publish) = tokio::time::timeout(Duration::from_secs(5), packets.recv())
            .await
            .unwrap()
            .unwrap();
        // QoS 1, not retained
        assert_eq!(header, 0x32);
        let (topic, at) = string_at(&publish, 0);
        assert_eq!(topic, "tracking/coordinates");
        assert_eq!(&publish[at + 2..], b"{}");

        broker.disconnect().await.unwrap();
        assert!(!broker.is_connected());
    }

    #[tokio::test]
    async fn rejected_session_is_refused() {
        let (listener, broker) = listen().await;
        let _packets = serve(listener, CONNACK_NOT_AUTHORIZED);
        let (events, _events_rx) = mpsc::unbounded_channel();

        let err = broker
            .connect(&session(Duration::from_secs(5)), events)
            .await
            .unwrap_err();

        assert!(matches!(err, LinkError::Refused(ref code) if code == "NotAuthorized"));
        assert!(!broker.is_connected());
    }

    #[tokio::test]
    async fn closed_socket_reports_one_connection_loss() {
        let (listener, broker) = listen().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_packet(&mut socket).await.unwrap();
            socket.write_all(&CONNACK_ACCEPTED).await.unwrap();
            // dropping the socket ends the session
        });
        let (events, mut events_rx) = mpsc::unbounded_channel();

        broker
            .connect(&session(Duration::from_secs(5)), events)
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap();
        assert!(matches!(first, Some(BrokerEvent::ConnectionLost(_))));
        assert!(!broker.is_connected());

        // The driver stops after reporting the loss
        let next = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap();
        assert_eq!(next, None);
    }

    #[tokio::test]
    async fn silent_broker_times_out_at_configured_deadline() {
        let (listener, broker) = listen().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut sink = Vec::new();
            let _ = socket.read_to_end(&mut sink).await;
        });
        let (events, _events_rx) = mpsc::unbounded_channel();

        let started = Instant::now();
        let result = broker.connect(&session(Duration::from_secs(7)), events).await;
        let elapsed = started.elapsed();

        assert!(result.is_err());
        assert!(!broker.is_connected());
        // Longer than rumqttc's own 5 s default
        assert!(elapsed >= Duration::from_millis(6500), "gave up after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(10));
    }
}
