//! End-to-end tests of the client against a scripted in-process server.

use chrono::Utc;
use serde_json::json;
use squirreldb_client::{Client, ClientError, Connection, ConnectionConfig, EncodingPreference};
use squirreldb_protocol::{
    ChangeEvent, ClientMessage, Document, Encoder, Encoding, FrameDecoder, HandshakeFlags,
    HandshakeRequest, HandshakeResponse, HandshakeStatus, MessageType, ServerMessage,
    MAX_PAYLOAD_SIZE,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use uuid::Uuid;

const SESSION_ID: &str = "550e8400-e29b-41d4-a716-446655440000";

struct MockServer {
    stream: DuplexStream,
    decoder: FrameDecoder,
    encoding: Encoding,
    hello: HandshakeRequest,
}

impl MockServer {
    /// Reads the client hello and answers it.
    async fn accept(mut stream: DuplexStream, status: HandshakeStatus, flags: HandshakeFlags) -> Self {
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        let (hello, used) = loop {
            match HandshakeRequest::decode(&received) {
                Ok(parsed) => break parsed,
                Err(e) if e.is_incomplete() => {
                    let n = stream.read(&mut buf).await.unwrap();
                    assert!(n > 0, "client hung up during handshake");
                    received.extend_from_slice(&buf[..n]);
                }
                Err(e) => panic!("bad hello: {e}"),
            }
        };

        let response = HandshakeResponse {
            status,
            version: 1,
            flags,
            session_id: Uuid::parse_str(SESSION_ID).unwrap(),
        };
        stream.write_all(&response.encode()).await.unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.extend(&received[used..]);
        let encoding = response.negotiated_encoding(hello.flags);

        Self {
            stream,
            decoder,
            encoding,
            hello,
        }
    }

    async fn accept_ok(stream: DuplexStream) -> Self {
        Self::accept(stream, HandshakeStatus::Success, HandshakeFlags::new(true, true)).await
    }

    /// Reads the next request frame, returning its encoding tag and message.
    async fn recv_frame(&mut self) -> (u8, ClientMessage) {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.decoder.decode_frame().unwrap() {
                assert_eq!(frame.message_type().unwrap(), MessageType::Request);
                return (frame.encoding, frame.decode_message().unwrap());
            }
            let n = self.stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed the stream");
            self.decoder.extend(&buf[..n]);
        }
    }

    async fn recv(&mut self) -> ClientMessage {
        self.recv_frame().await.1
    }

    async fn send(&mut self, message: &ServerMessage) {
        let bytes = Encoder::encode_server_message(message, self.encoding).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }
}

fn document(id: &str, data: serde_json::Value) -> Document {
    let now = Utc::now();
    Document {
        id: id.to_string(),
        collection: "users".to_string(),
        data,
        created_at: now,
        updated_at: now,
    }
}

async fn connect_pair(config: ConnectionConfig) -> (Client, MockServer) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (conn, server) = tokio::join!(
        Connection::establish(client_io, config),
        MockServer::accept_ok(server_io)
    );
    (Client::from_connection(conn.unwrap()), server)
}

#[tokio::test]
async fn test_handshake_negotiates_binary() {
    let config = ConnectionConfig::default().with_auth_token("s3cret");
    let (client, server) = connect_pair(config).await;

    assert!(client.is_connected());
    assert_eq!(client.encoding(), Encoding::BinaryPack);
    assert_eq!(client.session_id().to_string(), SESSION_ID);
    assert_eq!(server.hello.token, "s3cret");
    assert!(server.hello.flags.supports_binary());
    assert!(server.hello.flags.supports_json());
}

#[tokio::test]
async fn test_handshake_falls_back_to_json() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (conn, mut server) = tokio::join!(
        Connection::establish(client_io, ConnectionConfig::default()),
        MockServer::accept(server_io, HandshakeStatus::Success, HandshakeFlags::new(false, true))
    );
    let client = Client::from_connection(conn.unwrap());
    assert_eq!(client.encoding(), Encoding::Json);

    let (ping, ()) = tokio::join!(client.ping(), async {
        let (encoding, message) = server.recv_frame().await;
        assert_eq!(encoding, Encoding::Json as u8);
        server
            .send(&ServerMessage::Pong {
                id: message.id().to_string(),
            })
            .await;
    });
    ping.unwrap();
}

#[tokio::test]
async fn test_json_only_client() {
    let config = ConnectionConfig::default().with_encoding(EncodingPreference::JsonOnly);
    let (client, server) = connect_pair(config).await;
    assert!(!server.hello.flags.supports_binary());
    assert_eq!(client.encoding(), Encoding::Json);
}

#[tokio::test]
async fn test_auth_failure_fails_connect() {
    let (client_io, server_io) = tokio::io::duplex(1024);
    let (conn, _server) = tokio::join!(
        Connection::establish(client_io, ConnectionConfig::default().with_auth_token("bad")),
        MockServer::accept(server_io, HandshakeStatus::AuthFailed, HandshakeFlags::default())
    );
    assert!(matches!(conn, Err(ClientError::AuthFailed)));
}

#[tokio::test]
async fn test_version_mismatch_fails_connect() {
    let (client_io, server_io) = tokio::io::duplex(1024);
    let (conn, _server) = tokio::join!(
        Connection::establish(client_io, ConnectionConfig::default()),
        MockServer::accept(server_io, HandshakeStatus::VersionMismatch, HandshakeFlags::default())
    );
    assert!(matches!(
        conn,
        Err(ClientError::VersionMismatch { server_version: 1 })
    ));
}

#[tokio::test]
async fn test_server_hangs_up_during_handshake() {
    let (client_io, server_io) = tokio::io::duplex(1024);
    drop(server_io);
    let result = Connection::establish(client_io, ConnectionConfig::default()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_insert_returns_document() {
    let (client, mut server) = connect_pair(ConnectionConfig::default()).await;
    let data = json!({"name": "Alice", "age": 30, "active": true});

    let (inserted, ()) = tokio::join!(client.insert("users", data.clone()), async {
        match server.recv().await {
            ClientMessage::Insert {
                id,
                collection,
                data,
            } => {
                assert_eq!(collection, "users");
                let doc = document("doc-1", data);
                server
                    .send(&ServerMessage::Result {
                        id,
                        data: serde_json::to_value(doc).unwrap(),
                    })
                    .await;
            }
            other => panic!("unexpected request {other:?}"),
        }
    });

    let doc = inserted.unwrap();
    assert_eq!(doc.id, "doc-1");
    assert_eq!(doc.data, data);
}

#[tokio::test]
async fn test_query_passes_string_through() {
    let (client, mut server) = connect_pair(ConnectionConfig::default()).await;
    let query = r#"db.table("users").filter(u => u.age > 21).run()"#;

    let (result, ()) = tokio::join!(client.query(query), async {
        match server.recv().await {
            ClientMessage::Query { id, query: sent } => {
                assert_eq!(sent, query);
                server
                    .send(&ServerMessage::Result {
                        id,
                        data: json!([{"name": "Alice"}]),
                    })
                    .await;
            }
            other => panic!("unexpected request {other:?}"),
        }
    });

    assert_eq!(result.unwrap(), json!([{"name": "Alice"}]));
}

#[tokio::test]
async fn test_server_error_surfaces_text() {
    let (client, mut server) = connect_pair(ConnectionConfig::default()).await;

    let (result, ()) = tokio::join!(client.delete("users", "missing"), async {
        let message = server.recv().await;
        server
            .send(&ServerMessage::Error {
                id: message.id().to_string(),
                error: "document not found".to_string(),
            })
            .await;
    });

    match result {
        Err(ClientError::Server(text)) => assert_eq!(text, "document not found"),
        other => panic!("expected server error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_wrong_response_tag_is_contract_violation() {
    let (client, mut server) = connect_pair(ConnectionConfig::default()).await;

    let (result, ()) = tokio::join!(client.ping(), async {
        let message = server.recv().await;
        server
            .send(&ServerMessage::Result {
                id: message.id().to_string(),
                data: json!(null),
            })
            .await;
    });

    assert!(matches!(
        result,
        Err(ClientError::UnexpectedResponse {
            expected: "pong",
            got: "result"
        })
    ));
}

#[tokio::test]
async fn test_requests_written_in_call_order_and_answered_out_of_order() {
    let (client, mut server) = connect_pair(ConnectionConfig::default()).await;

    let server_side = async {
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(server.recv().await.id().to_string());
        }
        assert_eq!(ids, vec!["1", "2", "3"]);

        for id in ids.iter().rev() {
            server
                .send(&ServerMessage::Result {
                    id: id.clone(),
                    data: json!(format!("answer-{id}")),
                })
                .await;
        }
    };

    let (a, b, c, ()) = tokio::join!(
        client.query("first"),
        client.query("second"),
        client.query("third"),
        server_side
    );

    assert_eq!(a.unwrap(), json!("answer-1"));
    assert_eq!(b.unwrap(), json!("answer-2"));
    assert_eq!(c.unwrap(), json!("answer-3"));
}

#[tokio::test]
async fn test_list_collections() {
    let (client, mut server) = connect_pair(ConnectionConfig::default()).await;

    let (result, ()) = tokio::join!(client.list_collections(), async {
        match server.recv().await {
            ClientMessage::ListCollections { id } => {
                server
                    .send(&ServerMessage::Result {
                        id,
                        data: json!(["orders", "users"]),
                    })
                    .await
            }
            other => panic!("unexpected request {other:?}"),
        }
    });

    assert_eq!(result.unwrap(), vec!["orders", "users"]);
}

#[tokio::test]
async fn test_subscription_stream_and_unsubscribe() {
    let (client, mut server) = connect_pair(ConnectionConfig::default()).await;

    let (subscription, sub_id) = tokio::join!(client.subscribe_stream("users"), async {
        let message = server.recv().await;
        assert!(matches!(message, ClientMessage::Subscribe { .. }));
        let id = message.id().to_string();
        server.send(&ServerMessage::Subscribed { id: id.clone() }).await;
        id
    });
    let mut subscription = subscription.unwrap();
    assert_eq!(subscription.id(), sub_id);

    let inserted = document("doc-9", json!({"name": "Bob"}));
    server
        .send(&ServerMessage::Change {
            id: sub_id.clone(),
            change: ChangeEvent::Insert {
                new: inserted.clone(),
            },
        })
        .await;

    let change = subscription.next().await.unwrap();
    assert_eq!(change.document().id, "doc-9");

    let (result, ()) = tokio::join!(client.unsubscribe(&sub_id), async {
        match server.recv().await {
            ClientMessage::Unsubscribe {
                id,
                subscription_id,
            } => {
                assert_eq!(subscription_id, sub_id);
                // A change still in flight after the local removal is dropped.
                server
                    .send(&ServerMessage::Change {
                        id: sub_id.clone(),
                        change: ChangeEvent::Delete { old: inserted },
                    })
                    .await;
                server.send(&ServerMessage::Unsubscribed { id }).await;
            }
            other => panic!("unexpected request {other:?}"),
        }
    });
    result.unwrap();

    // The callback (and its sender) is gone, so the stream ends.
    assert!(subscription.next().await.is_none());
}

async fn ping_round_trip(client: &Client, server: &mut MockServer) {
    let (ping, ()) = tokio::join!(client.ping(), async {
        let message = server.recv().await;
        assert!(matches!(message, ClientMessage::Ping { .. }));
        server
            .send(&ServerMessage::Pong {
                id: message.id().to_string(),
            })
            .await;
    });
    ping.unwrap();
}

async fn open_subscription(client: &Client, server: &mut MockServer) -> squirreldb_client::Subscription {
    let (subscription, ()) = tokio::join!(client.subscribe_stream("users"), async {
        let message = server.recv().await;
        server
            .send(&ServerMessage::Subscribed {
                id: message.id().to_string(),
            })
            .await;
    });
    subscription.unwrap()
}

#[tokio::test]
async fn test_dropped_subscription_is_removed_locally() {
    let (client, mut server) = connect_pair(ConnectionConfig::default()).await;

    let subscription = open_subscription(&client, &mut server).await;
    ping_round_trip(&client, &mut server).await;
    assert_eq!(client.connection().subscription_count(), 1);

    drop(subscription);

    // Local removal only: the next thing on the wire is the ping.
    ping_round_trip(&client, &mut server).await;
    assert_eq!(client.connection().subscription_count(), 0);
}

#[tokio::test]
async fn test_subscription_does_not_keep_connection_open() {
    let (client, mut server) = connect_pair(ConnectionConfig::default()).await;
    let mut subscription = open_subscription(&client, &mut server).await;

    drop(client);

    assert!(subscription.next().await.is_none());
}

#[tokio::test]
async fn test_subscribe_rejected_by_server() {
    let (client, mut server) = connect_pair(ConnectionConfig::default()).await;

    let (result, ()) = tokio::join!(client.subscribe("bad query", |_| {}), async {
        let message = server.recv().await;
        server
            .send(&ServerMessage::Error {
                id: message.id().to_string(),
                error: "parse error".to_string(),
            })
            .await;
    });

    assert!(matches!(result, Err(ClientError::Server(_))));
}

#[tokio::test]
async fn test_server_close_fails_outstanding_requests() {
    let (client, mut server) = connect_pair(ConnectionConfig::default()).await;

    let (a, b, ()) = tokio::join!(client.ping(), client.query("x"), async move {
        server.recv().await;
        server.recv().await;
        server.stream.shutdown().await.unwrap();
        drop(server);
    });

    assert!(matches!(a, Err(ClientError::ConnectionClosed)));
    assert!(matches!(b, Err(ClientError::ConnectionClosed)));
    assert!(!client.is_connected());
    assert!(matches!(client.ping().await, Err(ClientError::ConnectionClosed)));
}

#[tokio::test]
async fn test_explicit_close_fails_outstanding_requests() {
    let (client, mut server) = connect_pair(ConnectionConfig::default()).await;

    let (a, b, ()) = tokio::join!(client.ping(), client.query("x"), async {
        server.recv().await;
        server.recv().await;
        client.close().await.unwrap();
    });

    assert!(matches!(a, Err(ClientError::ConnectionClosed)));
    assert!(matches!(b, Err(ClientError::ConnectionClosed)));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_oversized_frame_terminates_session() {
    let (client, mut server) = connect_pair(ConnectionConfig::default()).await;

    let (result, ()) = tokio::join!(client.ping(), async {
        server.recv().await;
        let mut header = (MAX_PAYLOAD_SIZE + 1 + 2).to_be_bytes().to_vec();
        header.extend_from_slice(&[MessageType::Response as u8, Encoding::Json as u8]);
        server.send_raw(&header).await;
    });

    assert!(matches!(result, Err(ClientError::ConnectionClosed)));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_response_split_across_chunks() {
    let (client, mut server) = connect_pair(ConnectionConfig::default()).await;

    let (result, ()) = tokio::join!(client.ping(), async {
        let message = server.recv().await;
        let bytes = Encoder::encode_server_message(
            &ServerMessage::Pong {
                id: message.id().to_string(),
            },
            server.encoding,
        )
        .unwrap();

        server.send_raw(&bytes[..6]).await;
        tokio::task::yield_now().await;
        server.send_raw(&bytes[6..bytes.len() - 1]).await;
        tokio::task::yield_now().await;
        server.send_raw(&bytes[bytes.len() - 1..]).await;
    });

    result.unwrap();
}

#[tokio::test]
async fn test_request_timeout_is_opt_in() {
    let config = ConnectionConfig::default().with_request_timeout(Duration::from_millis(50));
    let (client, mut server) = connect_pair(config).await;

    let (result, message) = tokio::join!(client.ping(), server.recv());
    assert!(matches!(result, Err(ClientError::Timeout)));

    // A late answer is dropped and the connection stays usable.
    server
        .send(&ServerMessage::Pong {
            id: message.id().to_string(),
        })
        .await;

    let (second, ()) = tokio::join!(client.ping(), async {
        let message = server.recv().await;
        server
            .send(&ServerMessage::Pong {
                id: message.id().to_string(),
            })
            .await;
    });
    second.unwrap();
}
