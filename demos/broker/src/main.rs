//! Standalone MQTT broker on top of relaymq.
//!
//! ```text
//! relaymq-broker [config.json]
//! ```
//!
//! The optional JSON file may set `bind`, a `broker` section (any subset
//! of `BrokerConfig`) and a `users` map of user name to password. With no
//! users every client is admitted. Log verbosity follows `RUST_LOG`.

use std::collections::HashMap;
use std::path::Path;

use relaymq::prelude::*;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    bind: Option<String>,
    broker: BrokerConfig,
    users: HashMap<String, String>,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Admits clients listed in the config file; everyone if the list is
/// empty.
struct UserList {
    users: HashMap<String, String>,
}

impl Authenticator for UserList {
    async fn authenticate(&self, username: Option<&str>, password: Option<&[u8]>) -> bool {
        if self.users.is_empty() {
            return true;
        }
        match (username.and_then(|name| self.users.get(name)), password) {
            (Some(expected), Some(given)) => expected.as_bytes() == given,
            _ => false,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args_os().nth(1) {
        Some(path) => FileConfig::load(Path::new(&path))?,
        None => FileConfig::default(),
    };
    let bind = config.bind.unwrap_or_else(|| "0.0.0.0:1883".to_string());
    tracing::info!(%bind, users = config.users.len(), "starting relaymq broker");

    let server = Broker::builder()
        .bind(&bind)
        .config(config.broker)
        .build(UserList {
            users: config.users,
        })
        .await?;

    server.run().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use relaymq::protocol::{
        Connect, Decoder, Packet, Properties, Publish, Subscribe, SubscribeFilter,
        SubscriptionOptions, encode,
    };
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn start(users: HashMap<String, String>) -> String {
        let server = Broker::builder()
            .bind("127.0.0.1:0")
            .build(UserList { users })
            .await
            .unwrap();
        let addr = server.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        addr
    }

    struct Client {
        stream: TcpStream,
        decoder: Decoder,
    }

    impl Client {
        async fn connect(addr: &str, client_id: &str, password: Option<&'static [u8]>) -> (Self, Packet) {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut client = Self {
                stream,
                decoder: Decoder::new(ProtocolVersion::V3_1_1, usize::MAX),
            };
            client
                .send(Packet::Connect(Box::new(Connect {
                    protocol_version: ProtocolVersion::V3_1_1,
                    client_id: client_id.to_string(),
                    clean_start: true,
                    keep_alive: 30,
                    username: password.map(|_| "alice".to_string()),
                    password: password.map(bytes::Bytes::from_static),
                    will: None,
                    properties: Properties::default(),
                })))
                .await;
            let connack = client.recv().await;
            (client, connack)
        }

        async fn send(&mut self, packet: Packet) {
            let mut bytes = BytesMut::new();
            encode(&packet, ProtocolVersion::V3_1_1, usize::MAX, &mut bytes).unwrap();
            self.stream.write_all(&bytes).await.unwrap();
        }

        async fn recv(&mut self) -> Packet {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    if let Some((packet, _)) = self.decoder.next_packet().unwrap() {
                        return packet;
                    }
                    let n = self.stream.read_buf(self.decoder.buffer_mut()).await.unwrap();
                    assert!(n > 0, "broker closed the connection");
                }
            })
            .await
            .expect("packet within 5s")
        }
    }

    fn accepted(packet: &Packet) -> bool {
        matches!(packet, Packet::ConnAck(connack) if connack.reason_code == ReasonCode::SUCCESS)
    }

    #[test]
    fn test_file_config_partial_json() {
        let json = r#"{ "bind": "127.0.0.1:1999", "users": { "alice": "pw" }, "broker": { "max_session_expiry": 60 } }"#;
        let config: FileConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.bind.as_deref(), Some("127.0.0.1:1999"));
        assert_eq!(config.users["alice"], "pw");
        assert_eq!(config.broker.max_session_expiry, 60);
        assert_eq!(config.broker.v5, ProtocolConfig::default());
    }

    #[tokio::test]
    async fn test_user_list_checks_password() {
        let users = UserList {
            users: HashMap::from([("alice".to_string(), "pw".to_string())]),
        };
        assert!(users.authenticate(Some("alice"), Some(b"pw".as_slice())).await);
        assert!(!users.authenticate(Some("alice"), Some(b"nope".as_slice())).await);
        assert!(!users.authenticate(None, None).await);

        let open = UserList {
            users: HashMap::new(),
        };
        assert!(open.authenticate(None, None).await);
    }

    #[tokio::test]
    async fn test_tcp_publish_reaches_subscriber() {
        let addr = start(HashMap::new()).await;

        let (mut sub, connack) = Client::connect(&addr, "sub", None).await;
        assert!(accepted(&connack));
        sub.send(Packet::Subscribe(Subscribe {
            packet_id: 1,
            filters: vec![SubscribeFilter {
                filter: "chat/#".into(),
                options: SubscriptionOptions::with_qos(QoS::AtMostOnce),
            }],
            properties: Properties::default(),
        }))
        .await;
        assert!(matches!(sub.recv().await, Packet::SubAck(_)));

        let (mut publisher, connack) = Client::connect(&addr, "pub", None).await;
        assert!(accepted(&connack));
        publisher
            .send(Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                topic: "chat/lobby".into(),
                packet_id: 0,
                payload: "hello".into(),
                properties: Properties::default(),
            }))
            .await;

        match sub.recv().await {
            Packet::Publish(publish) => {
                assert_eq!(&publish.topic[..], b"chat/lobby");
                assert_eq!(&publish.payload[..], b"hello");
            }
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tcp_wrong_password_is_refused() {
        let users = HashMap::from([("alice".to_string(), "pw".to_string())]);
        let addr = start(users).await;

        let (_, connack) = Client::connect(&addr, "dev", Some(b"nope".as_slice())).await;
        match connack {
            Packet::ConnAck(connack) => {
                assert_eq!(connack.reason_code, ReasonCode::BAD_USER_NAME_OR_PASSWORD)
            }
            other => panic!("expected CONNACK, got {other:?}"),
        }

        let (_, connack) = Client::connect(&addr, "dev", Some(b"pw".as_slice())).await;
        assert!(accepted(&connack));
    }
}
