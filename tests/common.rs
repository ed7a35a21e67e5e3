#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use blipmqtt::config::Config;
use blipmqtt::core::auth::{AllowAll, Authenticator};
use blipmqtt::core::error::SessionError;
use blipmqtt::core::packet::{
    read_packet, write_packet, Connack, Connect, ConnectReturnCode, Packet, Publish, QoS, Suback,
    Subscribe, MAX_REMAINING_LENGTH,
};
use blipmqtt::Broker;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);
pub const QUIET_PERIOD: Duration = Duration::from_millis(200);

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        blipmqtt::logging::init_logging_with("debug");
    });
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.bind_addr = "127.0.0.1:0".to_string();
    config.router.shard_count = 4;
    config.session.send_queue_length = 64;
    config
}

pub fn broker(config: &Config) -> Arc<Broker> {
    broker_with_auth(config, Arc::new(AllowAll))
}

pub fn broker_with_auth(config: &Config, authenticator: Arc<dyn Authenticator>) -> Arc<Broker> {
    init_logging();
    Arc::new(Broker::new(config, authenticator))
}

/// Opens an in-memory connection to `broker`.
pub fn attach(broker: &Broker) -> TestClient<DuplexStream> {
    attach_with_buffer(broker, 64 * 1024).0
}

/// Like [`attach`], with a chosen duplex buffer size, also returning the
/// session task.
pub fn attach_with_buffer(
    broker: &Broker,
    buffer: usize,
) -> (TestClient<DuplexStream>, JoinHandle<Result<(), SessionError>>) {
    let (client, server) = tokio::io::duplex(buffer);
    let session = broker.serve_connection(server, "duplex");
    (TestClient::new(client), session)
}

/// Minimal MQTT client for driving the broker from tests.
pub struct TestClient<S> {
    stream: S,
    next_id: u16,
}

impl<S> TestClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream, next_id: 1 }
    }

    pub async fn send(&mut self, packet: Packet) {
        write_packet(&mut self.stream, &packet)
            .await
            .expect("write to broker failed");
    }

    pub async fn recv(&mut self) -> Packet {
        timeout(RECV_TIMEOUT, read_packet(&mut self.stream, MAX_REMAINING_LENGTH))
            .await
            .expect("timed out waiting for a packet")
            .expect("read from broker failed")
    }

    /// Next packet, or `None` if nothing arrives within `wait`.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<Packet> {
        match timeout(wait, read_packet(&mut self.stream, MAX_REMAINING_LENGTH)).await {
            Ok(Ok(packet)) => Some(packet),
            Ok(Err(e)) => panic!("read from broker failed: {e}"),
            Err(_) => None,
        }
    }

    pub async fn recv_none(&mut self) {
        if let Some(packet) = self.try_recv(QUIET_PERIOD).await {
            panic!("expected no packet, got {packet:?}");
        }
    }

    pub async fn recv_publish(&mut self) -> Publish {
        match self.recv().await {
            Packet::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    }

    /// Asserts the broker closes the stream, skipping nothing.
    pub async fn expect_closed(&mut self) {
        let read = timeout(RECV_TIMEOUT, read_packet(&mut self.stream, MAX_REMAINING_LENGTH))
            .await
            .expect("broker did not close the connection");
        match read {
            Err(e) if e.is_eof() => {}
            other => panic!("expected EOF, got {other:?}"),
        }
    }

    pub async fn connect_with(&mut self, connect: Connect) -> Connack {
        self.send(Packet::Connect(connect)).await;
        match self.recv().await {
            Packet::Connack(connack) => connack,
            other => panic!("expected CONNACK, got {other:?}"),
        }
    }

    pub async fn connect(&mut self, client_id: &str) -> Connack {
        let connack = self.connect_with(Connect::new(client_id, 0)).await;
        assert_eq!(connack.code, ConnectReturnCode::Accepted);
        connack
    }

    fn packet_id(&mut self) -> u16 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    pub async fn subscribe(&mut self, filters: &[(&str, QoS)]) -> Suback {
        let packet_id = self.packet_id();
        self.send(Packet::Subscribe(Subscribe {
            packet_id,
            filters: filters.iter().map(|(f, q)| (f.to_string(), *q)).collect(),
        }))
        .await;
        match self.recv().await {
            Packet::Suback(suback) => {
                assert_eq!(suback.packet_id, packet_id);
                suback
            }
            other => panic!("expected SUBACK, got {other:?}"),
        }
    }

    /// Sends a PUBLISH and, above QoS 0, completes the broker-side ack.
    pub async fn publish(&mut self, topic: &str, payload: &'static str, qos: QoS, retain: bool) {
        let mut publish = Publish::new(topic, payload, qos);
        publish.retain = retain;
        if qos > QoS::AtMostOnce {
            publish.packet_id = Some(self.packet_id());
        }
        let packet_id = publish.packet_id;
        self.send(Packet::Publish(publish)).await;

        match (qos, packet_id) {
            (QoS::AtMostOnce, _) => {}
            (QoS::AtLeastOnce, Some(id)) => assert_eq!(self.recv().await, Packet::Puback(id)),
            (QoS::ExactlyOnce, Some(id)) => {
                assert_eq!(self.recv().await, Packet::Pubrec(id));
                self.send(Packet::Pubrel(id)).await;
                assert_eq!(self.recv().await, Packet::Pubcomp(id));
            }
            _ => unreachable!(),
        }
    }

    /// Round-trips a PINGREQ, proving the session is alive and has handled
    /// everything sent before it.
    pub async fn ping(&mut self) {
        self.send(Packet::Pingreq).await;
        assert_eq!(self.recv().await, Packet::Pingresp);
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}
