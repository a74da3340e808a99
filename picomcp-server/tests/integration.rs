//! End-to-end tests over real TCP sockets.

/// The `testing` module in the server crate is only compiled for unit tests; integration tests
/// pull the same file in directly.
#[path = "../src/testing.rs"]
mod test_helpers;
mod test_service;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use picomcp_jsonrpc::Framing;
use picomcp_server::{Server, ServerConfig, SessionState};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec, LinesCodec};

const WAIT: Duration = Duration::from_secs(5);

type LineClient = Framed<TcpStream, LinesCodec>;

/// Start `server` on an ephemeral loopback port.
async fn start(server: &Server) -> (SocketAddr, JoinHandle<()>) {
    test_helpers::init_test_logging();

    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = server.clone();
    let task = tokio::spawn(async move { serving.serve(listener).await });
    (addr, task)
}

async fn connect(addr: SocketAddr) -> LineClient {
    Framed::new(TcpStream::connect(addr).await.unwrap(), LinesCodec::new())
}

async fn call(client: &mut LineClient, request: Value) -> Value {
    client.send(request.to_string()).await.unwrap();
    let line = tokio::time::timeout(WAIT, client.next())
        .await
        .expect("timed out waiting for a response")
        .expect("connection closed")
        .unwrap();
    serde_json::from_str(&line).unwrap()
}

async fn expect_closed(client: &mut LineClient) {
    let next = tokio::time::timeout(WAIT, client.next())
        .await
        .expect("server did not close the connection");
    assert!(next.is_none() || next.is_some_and(|r| r.is_err()), "connection is still open");
}

/// Wait until the server is tracking exactly `count` sessions.
async fn wait_for_sessions(server: &Server, count: usize) {
    tokio::time::timeout(WAIT, async {
        loop {
            server.sessions().cleanup_finished();
            if server.sessions().len() == count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("expected {count} sessions, have {}", server.sessions().len()));
}

#[tokio::test]
async fn concurrent_sessions_get_their_own_responses() {
    const CLIENTS: usize = 6;

    let mut config = test_service::test_config();
    config.max_connections = CLIENTS;
    let server = test_service::test_server(config);
    let (addr, _serving) = start(&server).await;

    let clients = (0..CLIENTS).map(|n| {
        tokio::spawn(async move {
            let mut client = connect(addr).await;

            let init = call(
                &mut client,
                json!({"jsonrpc": "2.0", "id": format!("init-{n}"), "method": "initialize", "params": {"clientInfo": {"name": format!("client-{n}"), "version": "1"}}}),
            )
            .await;
            assert_eq!(init["id"], json!(format!("init-{n}")));
            assert_eq!(init["result"]["protocolVersion"], json!("2024-11-05"));

            client
                .send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string())
                .await
                .unwrap();

            for i in 0..10 {
                let id = (n * 100 + i) as i64;
                let pong = call(&mut client, json!({"jsonrpc": "2.0", "id": id, "method": "ping"})).await;
                assert_eq!(pong, json!({"jsonrpc": "2.0", "id": id, "result": {}}));

                let text = format!("client {n} message {i}");
                let echo = call(
                    &mut client,
                    json!({"jsonrpc": "2.0", "id": id, "method": "tools/call", "params": {"name": "echo", "arguments": {"text": text}}}),
                )
                .await;
                assert_eq!(echo["id"], json!(id));
                assert_eq!(echo["result"]["content"][0]["text"], json!(format!("Echo: {text}")));
            }
        })
    });

    for result in futures::future::join_all(clients).await {
        result.unwrap();
    }

    server.shutdown();
}

#[tokio::test]
async fn connections_beyond_the_limit_are_closed() {
    let mut config = test_service::test_config();
    config.max_connections = 1;
    let server = test_service::test_server(config);
    let (addr, _serving) = start(&server).await;

    let mut first = connect(addr).await;
    let pong = call(&mut first, json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})).await;
    assert_eq!(pong["result"], json!({}));

    let mut second = connect(addr).await;
    expect_closed(&mut second).await;
    assert_eq!(server.sessions().len(), 1);

    // Once the first client leaves its slot is free again
    drop(first);
    wait_for_sessions(&server, 0).await;

    let mut third = connect(addr).await;
    let pong = call(&mut third, json!({"jsonrpc": "2.0", "id": 3, "method": "ping"})).await;
    assert_eq!(pong["id"], json!(3));

    server.shutdown();
}

#[tokio::test]
async fn shutdown_closes_every_session() {
    let server = test_service::test_server(test_service::test_config());
    let (addr, serving) = start(&server).await;

    let mut clients = Vec::new();
    for id in 0..2 {
        let mut client = connect(addr).await;
        call(&mut client, json!({"jsonrpc": "2.0", "id": id, "method": "ping"})).await;
        clients.push(client);
    }
    let handles = server.sessions().snapshot();
    assert_eq!(handles.len(), 2);

    server.shutdown();
    tokio::time::timeout(WAIT, serving).await.unwrap().unwrap();

    for client in &mut clients {
        expect_closed(client).await;
    }
    wait_for_sessions(&server, 0).await;
    for handle in handles {
        assert_eq!(handle.state(), SessionState::Shutdown);
    }
    assert!(server.is_shutting_down());
}

#[tokio::test]
async fn length_prefixed_framing_over_tcp() {
    let mut config = test_service::test_config();
    config.session.framing = Framing::LengthPrefixed;
    let server = test_service::test_server(config);
    let (addr, _serving) = start(&server).await;

    let mut client = Framed::new(TcpStream::connect(addr).await.unwrap(), LengthDelimitedCodec::new());

    let request = json!({"jsonrpc": "2.0", "id": "lp", "method": "initialize", "params": {}});
    client.send(Bytes::from(request.to_string())).await.unwrap();

    let frame = tokio::time::timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();
    let response: Value = serde_json::from_slice(&frame).unwrap();
    assert_eq!(response["id"], json!("lp"));
    assert_eq!(response["result"]["serverInfo"]["name"], json!("picomcp-test"));

    server.shutdown();
}

#[tokio::test]
async fn error_budget_disconnects_noisy_clients() {
    let mut config = test_service::test_config();
    config.session.max_errors_per_second = 100;
    config.session.max_total_errors = 5;
    let server = test_service::test_server(config);
    let (addr, _serving) = start(&server).await;

    let mut client = connect(addr).await;
    for id in 0..6 {
        let response = call(&mut client, json!({"jsonrpc": "2.0", "id": id, "method": "tools/list"})).await;
        assert_eq!(response["error"]["code"], json!(-32002));
    }
    expect_closed(&mut client).await;

    server.shutdown();
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let mut config = ServerConfig::default();
    config.max_connections = 0;
    assert!(Server::new(config, test_service::test_tools()).is_err());
}
