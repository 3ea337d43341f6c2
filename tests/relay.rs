//! End-to-end tests: synchronizers talking to the relay over real WebSockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use vibe_chat::server::{routes, Server};
use vibe_chat::{
    Backend, ChannelTransport, ClientConfig, LocalUser, MessageSynchronizer, Notification, SyncConfig,
    WsTransport,
};

async fn start_relay() -> (SocketAddr, Backend) {
    let backend = Backend::new();
    let server = Arc::new(Server::new(backend.clone()));
    let (addr, serving) = warp::serve(routes(server)).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(serving);
    (addr, backend)
}

fn client_config(addr: SocketAddr, id: &str, name: &str, secret: Option<&str>) -> ClientConfig {
    ClientConfig {
        relay_url: format!("ws://{addr}/ws"),
        channel_secret: secret.map(str::to_string),
        user: LocalUser::new(id, name),
        sync: SyncConfig::default(),
    }
}

/// Drives `sync` until `done` holds, failing after two seconds.
async fn until<T, F>(sync: &mut MessageSynchronizer<T>, done: F)
where
    T: ChannelTransport + ?Sized,
    F: Fn(&MessageSynchronizer<T>) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !done(&*sync) {
            sync.process_next().await;
        }
    })
    .await
    .expect("condition reached in time");
}

#[tokio::test]
async fn test_echo_over_relay_confirms_and_reaches_peer() {
    let (addr, backend) = start_relay().await;

    let mine_config = client_config(addr, "me", "Me", None);
    let peer_config = client_config(addr, "riya", "Riya", None);
    let (mut mine, _mine_n) = MessageSynchronizer::new(
        Arc::new(WsTransport::connect(&mine_config).await.unwrap()),
        mine_config.user.clone(),
        SyncConfig::default(),
    );
    let (mut peer, mut peer_n) = MessageSynchronizer::new(
        Arc::new(WsTransport::connect(&peer_config).await.unwrap()),
        peer_config.user.clone(),
        SyncConfig::default(),
    );

    mine.load("global");
    peer.load("global");
    until(&mut mine, |s| !s.is_loading() && s.is_subscribed()).await;
    until(&mut peer, |s| !s.is_loading() && s.is_subscribed()).await;

    mine.send("meet at the fountain").expect("sendable");
    until(&mut mine, |s| s.messages().iter().all(|m| !m.is_pending())).await;
    until(&mut peer, |s| s.messages().len() == 1).await;

    assert_eq!(mine.messages().len(), 1);
    assert_eq!(mine.messages()[0].id, peer.messages()[0].id);
    assert_eq!(backend.messages("global").await.len(), 1);

    let received = peer_n.recv().await.expect("notification");
    assert!(matches!(received, Notification::Received(m) if m.text == "meet at the fountain"));
}

#[tokio::test]
async fn test_sealed_channel_hides_text_from_relay() {
    let (addr, backend) = start_relay().await;
    let config = client_config(addr, "me", "Me", Some("campus-secret"));
    let (mut sync, _n) = MessageSynchronizer::new(
        Arc::new(WsTransport::connect(&config).await.unwrap()),
        config.user.clone(),
        SyncConfig::default(),
    );

    sync.load("event-42");
    until(&mut sync, |s| !s.is_loading() && s.is_subscribed()).await;
    sync.send("bring snacks").expect("sendable");
    until(&mut sync, |s| s.messages().iter().all(|m| !m.is_pending())).await;

    assert_eq!(sync.messages()[0].text, "bring snacks");
    let stored = backend.messages("event-42").await;
    assert_eq!(stored.len(), 1);
    assert_ne!(stored[0].text, "bring snacks");

    // History comes back readable on reload.
    sync.reload();
    until(&mut sync, |s| !s.is_loading()).await;
    assert_eq!(sync.messages()[0].text, "bring snacks");
}

#[tokio::test]
async fn test_delete_over_relay_removes_from_backend() {
    let (addr, backend) = start_relay().await;
    let config = client_config(addr, "me", "Me", None);
    let (mut sync, mut notifications) = MessageSynchronizer::new(
        Arc::new(WsTransport::connect(&config).await.unwrap()),
        config.user.clone(),
        SyncConfig::default(),
    );

    sync.load("random");
    until(&mut sync, |s| !s.is_loading() && s.is_subscribed()).await;
    sync.send("typo").expect("sendable");
    until(&mut sync, |s| s.messages().iter().all(|m| !m.is_pending())).await;

    let id = sync.messages()[0].id.clone();
    sync.delete(&id).unwrap();
    assert!(sync.messages().is_empty());

    tokio::time::timeout(Duration::from_secs(2), async {
        while !backend.messages("random").await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("backend delete");
    sync.process_pending();
    while let Ok(n) = notifications.try_recv() {
        assert!(!matches!(n, Notification::DeleteFailed { .. }));
    }
}

async fn wait_for_subscribers(backend: &Backend, channel_id: &str, expected: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while backend.subscriber_count(channel_id).await != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("relay subscriber count settled");
}

#[tokio::test]
async fn test_quick_channel_switch_leaves_no_relay_subscription() {
    let (addr, backend) = start_relay().await;
    let config = client_config(addr, "me", "Me", None);
    let (mut sync, _n) = MessageSynchronizer::new(
        Arc::new(WsTransport::connect(&config).await.unwrap()),
        config.user.clone(),
        SyncConfig::default(),
    );

    sync.load("a");
    tokio::task::yield_now().await;
    sync.load("b");
    until(&mut sync, |s| !s.is_loading() && s.is_subscribed()).await;

    wait_for_subscribers(&backend, "a", 0).await;
    assert_eq!(backend.subscriber_count("b").await, 1);
}

#[tokio::test]
async fn test_push_for_left_channel_is_not_shown() {
    let (addr, backend) = start_relay().await;
    let config = client_config(addr, "me", "Me", None);
    let (mut sync, _n) = MessageSynchronizer::new(
        Arc::new(WsTransport::connect(&config).await.unwrap()),
        config.user.clone(),
        SyncConfig::default(),
    );

    sync.load("a");
    until(&mut sync, |s| !s.is_loading() && s.is_subscribed()).await;
    sync.load("b");
    until(&mut sync, |s| !s.is_loading() && s.is_subscribed()).await;
    wait_for_subscribers(&backend, "a", 0).await;

    backend.post("a", "left behind", "riya", None).await.unwrap();
    backend.post("b", "over here", "riya", None).await.unwrap();
    until(&mut sync, |s| !s.messages().is_empty()).await;
    sync.process_pending();

    let texts: Vec<&str> = sync.messages().iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, ["over here"]);
}
