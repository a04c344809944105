use super::*;
use crate::message::{IceCandidate, SessionDescription};
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::http::{StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

/// In-process collider: one websocket endpoint plus wildcard POST/DELETE
/// routes standing in for the REST fallback surface.
#[derive(Clone)]
struct ColliderState {
    frames: Arc<Mutex<Vec<String>>>,
    posts: Arc<Mutex<Vec<(String, String)>>>,
    deletes: Arc<Mutex<Vec<String>>>,
    to_client: Arc<tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>>,
}

struct TestCollider {
    ws_url: Url,
    post_url: Url,
    frames: Arc<Mutex<Vec<String>>>,
    posts: Arc<Mutex<Vec<(String, String)>>>,
    deletes: Arc<Mutex<Vec<String>>>,
    to_client: mpsc::UnboundedSender<String>,
}

async fn start_collider() -> TestCollider {
    let (to_client, to_client_rx) = mpsc::unbounded_channel();
    let state = ColliderState {
        frames: Arc::new(Mutex::new(Vec::new())),
        posts: Arc::new(Mutex::new(Vec::new())),
        deletes: Arc::new(Mutex::new(Vec::new())),
        to_client: Arc::new(tokio::sync::Mutex::new(Some(to_client_rx))),
    };
    let router = Router::new()
        .route("/ws", get(ws_handler))
        .route("/*path", post(record_post).delete(record_delete))
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    TestCollider {
        ws_url: Url::parse(&format!("ws://{addr}/ws")).unwrap(),
        post_url: Url::parse(&format!("http://{addr}/msg/")).unwrap(),
        frames: state.frames,
        posts: state.posts,
        deletes: state.deletes,
        to_client,
    }
}

async fn ws_handler(State(state): State<ColliderState>, upgrade: WebSocketUpgrade) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: ColliderState) {
    let mut rx = state
        .to_client
        .lock()
        .await
        .take()
        .expect("collider accepts a single connection");
    loop {
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Some(Ok(WsMessage::Text(text))) => state.frames.lock().unwrap().push(text),
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
            outbound = rx.recv() => match outbound {
                Some(text) => {
                    if socket.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

async fn record_post(State(state): State<ColliderState>, uri: Uri, body: String) -> StatusCode {
    state.posts.lock().unwrap().push((uri.path().to_string(), body));
    StatusCode::OK
}

async fn record_delete(State(state): State<ColliderState>, uri: Uri) -> StatusCode {
    state.deletes.lock().unwrap().push(uri.path().to_string());
    StatusCode::OK
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for channel event")
        .expect("event channel closed")
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Websocket endpoint that completes the TCP connect but never finishes the
/// upgrade, pinning the channel in `Closed`.
async fn stalled_ws_url() -> Url {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let mut sockets = Vec::new();
        loop {
            match listener.accept().await {
                Ok((socket, _)) => sockets.push(socket),
                Err(_) => break,
            }
        }
    });
    Url::parse(&format!("ws://{addr}/ws")).unwrap()
}

fn offer() -> SignalingMessage {
    SignalingMessage::description(SessionDescription::offer("v=0 offer"))
}

#[tokio::test]
async fn registers_and_sends_over_live_connection() {
    let collider = start_collider().await;
    let (events, mut rx) = mpsc::unbounded_channel();
    let channel = SignalingChannel::new(collider.ws_url.clone(), collider.post_url.clone(), events)
        .unwrap();

    assert!(matches!(
        next_event(&mut rx).await,
        ChannelEvent::State(ChannelState::Open)
    ));
    channel.register("r1", "c1").unwrap();
    assert!(matches!(
        next_event(&mut rx).await,
        ChannelEvent::State(ChannelState::Registered)
    ));

    let frames = Arc::clone(&collider.frames);
    wait_until("register frame", || !frames.lock().unwrap().is_empty()).await;
    let register: serde_json::Value =
        serde_json::from_str(&collider.frames.lock().unwrap()[0]).unwrap();
    assert_eq!(
        register,
        serde_json::json!({ "cmd": "register", "roomid": "r1", "clientid": "c1" })
    );

    channel.send(&offer()).unwrap();
    let frames = Arc::clone(&collider.frames);
    wait_until("send frame", || frames.lock().unwrap().len() >= 2).await;
    let frame: serde_json::Value =
        serde_json::from_str(&collider.frames.lock().unwrap()[1]).unwrap();
    assert_eq!(frame["cmd"], "send");
    let relayed = SignalingMessage::decode(frame["msg"].as_str().unwrap()).unwrap();
    assert_eq!(relayed, offer());
    assert!(collider.posts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn register_requested_before_open_applies_once_connected() {
    let collider = start_collider().await;
    let (events, mut rx) = mpsc::unbounded_channel();
    let channel = SignalingChannel::new(collider.ws_url.clone(), collider.post_url.clone(), events)
        .unwrap();
    // No wait for Open: registration may land before or after the handshake
    // resolves, the observable outcome is the same.
    channel.register("r2", "c2").unwrap();

    assert!(matches!(
        next_event(&mut rx).await,
        ChannelEvent::State(ChannelState::Open)
    ));
    assert!(matches!(
        next_event(&mut rx).await,
        ChannelEvent::State(ChannelState::Registered)
    ));
    let frames = Arc::clone(&collider.frames);
    wait_until("register frame", || !frames.lock().unwrap().is_empty()).await;
    let register: serde_json::Value =
        serde_json::from_str(&collider.frames.lock().unwrap()[0]).unwrap();
    assert_eq!(register["cmd"], "register");
}

#[tokio::test]
async fn delivers_inbound_messages_and_suppresses_error_frames() {
    let collider = start_collider().await;
    let (events, mut rx) = mpsc::unbounded_channel();
    let _channel = SignalingChannel::new(collider.ws_url.clone(), collider.post_url.clone(), events)
        .unwrap();
    assert!(matches!(
        next_event(&mut rx).await,
        ChannelEvent::State(ChannelState::Open)
    ));

    collider
        .to_client
        .send(serde_json::json!({ "msg": SignalingMessage::Bye.encode() }).to_string())
        .unwrap();
    match next_event(&mut rx).await {
        ChannelEvent::Message(SignalingMessage::Bye) => {}
        other => panic!("expected bye, got {other:?}"),
    }

    // An error frame is logged and suppressed; the next well-formed frame
    // still comes through.
    collider
        .to_client
        .send(serde_json::json!({ "error": "boom" }).to_string())
        .unwrap();
    let candidate = SignalingMessage::Candidate(IceCandidate {
        sdp_mid: "audio".into(),
        sdp_mline_index: 0,
        sdp: "candidate:1".into(),
    });
    collider
        .to_client
        .send(serde_json::json!({ "msg": candidate.encode() }).to_string())
        .unwrap();
    match next_event(&mut rx).await {
        ChannelEvent::Message(received) => assert_eq!(received, candidate),
        other => panic!("expected candidate, got {other:?}"),
    }
}

#[tokio::test]
async fn falls_back_to_rest_post_while_not_registered() {
    let collider = start_collider().await;
    let ws_url = stalled_ws_url().await;
    let (events, _rx) = mpsc::unbounded_channel();
    let channel = SignalingChannel::new(ws_url, collider.post_url.clone(), events).unwrap();

    channel.register("r1", "c1").unwrap();
    assert_eq!(channel.state(), ChannelState::Closed);
    channel.send(&offer()).unwrap();

    let posts = Arc::clone(&collider.posts);
    wait_until("fallback post", || !posts.lock().unwrap().is_empty()).await;
    let recorded = collider.posts.lock().unwrap();
    assert_eq!(recorded[0].0, "/msg/r1c1");
    assert_eq!(recorded[0].1, offer().encode());
}

#[tokio::test]
async fn send_without_identifiers_is_rejected() {
    let collider = start_collider().await;
    let ws_url = stalled_ws_url().await;
    let (events, _rx) = mpsc::unbounded_channel();
    let channel = SignalingChannel::new(ws_url, collider.post_url.clone(), events).unwrap();

    assert!(matches!(
        channel.send(&offer()),
        Err(ChannelError::NotRegistered)
    ));
    assert!(matches!(
        channel.register("", "c1"),
        Err(ChannelError::InvalidIdentifiers)
    ));
}

#[tokio::test]
async fn disconnect_releases_registration_once() {
    let collider = start_collider().await;
    let (events, mut rx) = mpsc::unbounded_channel();
    let channel = SignalingChannel::new(collider.ws_url.clone(), collider.post_url.clone(), events)
        .unwrap();
    assert!(matches!(
        next_event(&mut rx).await,
        ChannelEvent::State(ChannelState::Open)
    ));
    channel.register("r1", "c1").unwrap();
    assert!(matches!(
        next_event(&mut rx).await,
        ChannelEvent::State(ChannelState::Registered)
    ));

    channel.disconnect();
    assert!(matches!(
        next_event(&mut rx).await,
        ChannelEvent::State(ChannelState::Closed)
    ));
    let deletes = Arc::clone(&collider.deletes);
    wait_until("collider delete", || !deletes.lock().unwrap().is_empty()).await;
    assert_eq!(collider.deletes.lock().unwrap()[0], "/msg/r1c1");

    channel.disconnect();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(collider.deletes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn connect_failure_surfaces_error_state() {
    // Bind then drop to get an address with nothing listening.
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let (events, mut rx) = mpsc::unbounded_channel();
    let _channel = SignalingChannel::new(
        Url::parse(&format!("ws://{addr}/ws")).unwrap(),
        Url::parse("http://127.0.0.1:1/msg/").unwrap(),
        events,
    )
    .unwrap();
    assert!(matches!(
        next_event(&mut rx).await,
        ChannelEvent::State(ChannelState::Error)
    ));
}
