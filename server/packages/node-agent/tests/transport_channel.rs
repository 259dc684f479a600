mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use futures::{SinkExt, StreamExt};
use node_agent::auth::Authenticator;
use node_agent::config::AgentConfig;
use node_agent::policy::SecurityPolicy;
use node_agent::pty::PtyManager;
use node_agent::report::ConnectionLog;
use node_agent::router::CommandRouter;
use node_agent::transport::{CommandTransport, ConnectionState};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

async fn next_json<S>(source: &mut S) -> Value
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(10), source.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("frame ok");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("json frame");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn signed_command_round_trips_over_websocket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let requested = Arc::new(Mutex::new(None::<String>));

    let captured = Arc::clone(&requested);
    let controller = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let callback = move |request: &Request, response: Response| {
            *captured.lock().unwrap() = Some(request.uri().to_string());
            Ok::<_, ErrorResponse>(response)
        };
        let socket = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .expect("handshake");
        let (mut sink, mut source) = socket.split();

        // Keepalive frames from the controller never reach the router.
        sink.send(Message::Text(r#"{"type":"ping"}"#.to_string()))
            .await
            .expect("send ping");
        sink.send(Message::Text("not json".to_string()))
            .await
            .expect("send garbage");

        let envelope = signed(json!({
            "type": "exec_script",
            "command_id": "e2e-1",
            "script_content": "echo hi"
        }));
        sink.send(Message::Text(envelope.to_string()))
            .await
            .expect("send command");

        let frame = next_json(&mut source).await;
        (sink, source, frame)
    });

    let config = AgentConfig::new(&format!("http://{addr}"), TOKEN, "node-7", SECRET).expect("config");
    let log = Arc::new(ConnectionLog::default());
    let transport = Arc::new(
        CommandTransport::new(
            config.channel_url().expect("url"),
            &config.redacted_channel_url().expect("url"),
        )
        .with_connection_log(Arc::clone(&log)),
    );
    let router = Arc::new(CommandRouter::new(
        Authenticator::new(SECRET, TOKEN),
        SecurityPolicy::new().expect("policy"),
        PtyManager::new(),
        transport.clone(),
        false,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(Arc::clone(&transport).run(router, shutdown_rx));

    let (_sink, _source, frame) = tokio::time::timeout(Duration::from_secs(15), controller)
        .await
        .expect("controller finished")
        .expect("controller task");

    assert_eq!(
        frame,
        json!({
            "type": "command_result",
            "command_id": "e2e-1",
            "status": "completed",
            "output": "hi\n",
            "exit_code": 0
        })
    );
    assert_eq!(
        requested.lock().unwrap().as_deref(),
        Some(format!("/api/v2/agent/ws?token={TOKEN}&node_uuid=node-7").as_str())
    );
    assert_eq!(transport.state(), ConnectionState::Connected);

    shutdown_tx.send(true).expect("signal shutdown");
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("transport stops")
        .expect("transport task");
    assert_eq!(transport.state(), ConnectionState::Stopped);

    let records = log.take();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, node_agent::report::ConnectionOutcome::Shutdown);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnects_after_the_controller_drops_the_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let controller = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept first");
        let mut socket = tokio_tungstenite::accept_async(stream).await.expect("handshake");
        socket.close(None).await.expect("close");
        drop(socket);

        let (stream, _) = listener.accept().await.expect("accept second");
        tokio_tungstenite::accept_async(stream).await.expect("handshake")
    });

    let url = url::Url::parse(&format!("ws://{addr}/api/v2/agent/ws")).expect("url");
    let transport = Arc::new(CommandTransport::new(url.clone(), &url));
    let router = TestAgent::new().router;
    let mut state = transport.subscribe_state();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(Arc::clone(&transport).run(router, shutdown_rx));

    let _second = tokio::time::timeout(Duration::from_secs(10), controller)
        .await
        .expect("reconnected within the first backoff step")
        .expect("controller task");
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|state| *state == ConnectionState::Connected),
    )
    .await
    .expect("connected again")
    .expect("state channel open");

    shutdown_tx.send(true).expect("signal shutdown");
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("transport stops")
        .expect("transport task");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sends_keepalive_pings_while_connected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let controller = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let socket = tokio_tungstenite::accept_async(stream).await.expect("handshake");
        let (sink, mut source) = socket.split();
        let frame = next_json(&mut source).await;
        (sink, source, frame)
    });

    let url = url::Url::parse(&format!("ws://{addr}/api/v2/agent/ws")).expect("url");
    let transport = Arc::new(CommandTransport::new(url.clone(), &url).with_keepalive(Duration::from_millis(200)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(Arc::clone(&transport).run(TestAgent::new().router, shutdown_rx));

    let (_sink, _source, frame) = tokio::time::timeout(Duration::from_secs(10), controller)
        .await
        .expect("ping in time")
        .expect("controller task");
    assert_eq!(frame, json!({"type": "ping"}));

    shutdown_tx.send(true).expect("signal shutdown");
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("transport stops")
        .expect("transport task");
}
