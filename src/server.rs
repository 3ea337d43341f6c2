use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;
use warp::ws::{Message as WsMessage, WebSocket};
use warp::Filter;

use crate::backend::Backend;
use crate::messages::{ClientFrame, ServerFrame};
use crate::models::Message;

type Outbox = mpsc::UnboundedSender<WsMessage>;

/// WebSocket relay in front of an in-memory [`Backend`].
#[derive(Clone, Default)]
pub struct Server {
    backend: Backend,
}

struct ChannelFeed {
    subscriber_id: String,
    forwarder: JoinHandle<()>,
}

/// Per-connection state, owned by the connection's reader loop.
struct Session {
    participant_id: String,
    user_id: Option<String>,
    feeds: HashMap<String, ChannelFeed>, // channel_id -> feed
    outbox: Outbox,
}

impl Server {
    pub fn new(backend: Backend) -> Self {
        Server { backend }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub async fn handle_connection(&self, ws: WebSocket) {
        let participant_id = Uuid::new_v4().to_string();
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        info!("Participant {} connected", participant_id);

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = ws_tx.send(message).await {
                    error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        let mut session = Session {
            participant_id,
            user_id: None,
            feeds: HashMap::new(),
            outbox: tx,
        };

        while let Some(result) = ws_rx.next().await {
            match result {
                Ok(msg) => {
                    if msg.is_close() {
                        break;
                    }
                    let Ok(text) = msg.to_str() else { continue };
                    match serde_json::from_str::<ClientFrame>(text) {
                        Ok(frame) => self.handle_client_frame(frame, &mut session).await,
                        Err(e) => {
                            warn!("Malformed frame from {}: {}", session.participant_id, e);
                            Self::reply(
                                &session.outbox,
                                &ServerFrame::Error {
                                    request_id: None,
                                    message: "Malformed frame".to_string(),
                                },
                            );
                        }
                    }
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
            }
        }

        self.handle_disconnect(&mut session).await;
    }

    async fn handle_client_frame(&self, frame: ClientFrame, session: &mut Session) {
        match frame {
            ClientFrame::Hello { user_id } => {
                debug!("Participant {} is {}", session.participant_id, user_id);
                session.user_id = Some(user_id);
            }

            ClientFrame::FetchMessages {
                request_id,
                channel_id,
            } => {
                let messages = self.backend.messages(&channel_id).await;
                Self::reply(
                    &session.outbox,
                    &ServerFrame::Messages {
                        request_id,
                        messages,
                    },
                );
            }

            ClientFrame::Subscribe {
                request_id,
                channel_id,
            } => {
                if !session.feeds.contains_key(&channel_id) {
                    let feed = self.open_feed(&channel_id, &session.outbox).await;
                    session.feeds.insert(channel_id, feed);
                }
                Self::reply(&session.outbox, &ServerFrame::Ack { request_id });
            }

            ClientFrame::Unsubscribe { channel_id } => {
                if let Some(feed) = session.feeds.remove(&channel_id) {
                    self.close_feed(&channel_id, feed).await;
                }
            }

            ClientFrame::SendMessage {
                request_id,
                channel_id,
                text,
                sender,
            } => {
                let Some(user_id) = session.user_id.clone() else {
                    Self::reject(&session.outbox, request_id, "Say hello before sending");
                    return;
                };
                match self.backend.post(&channel_id, &text, &user_id, sender).await {
                    Ok(_) => {
                        Self::reply(&session.outbox, &ServerFrame::Ack { request_id });
                    }
                    Err(e) => Self::reject(&session.outbox, request_id, &e.to_string()),
                }
            }

            ClientFrame::DeleteMessage {
                request_id,
                message_id,
            } => {
                let Some(user_id) = session.user_id.clone() else {
                    Self::reject(&session.outbox, request_id, "Say hello before deleting");
                    return;
                };
                match self.backend.delete(&message_id, &user_id).await {
                    Ok(()) => {
                        Self::reply(&session.outbox, &ServerFrame::Ack { request_id });
                    }
                    Err(e) => Self::reject(&session.outbox, request_id, &e.to_string()),
                }
            }
        }
    }

    async fn open_feed(&self, channel_id: &str, outbox: &Outbox) -> ChannelFeed {
        let subscriber_id = Uuid::new_v4().to_string();
        let (push_tx, mut push_rx) = mpsc::unbounded_channel::<Message>();
        self.backend
            .subscribe(channel_id, subscriber_id.clone(), push_tx)
            .await;

        let outbox = outbox.clone();
        let channel = channel_id.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some(message) = push_rx.recv().await {
                let frame = ServerFrame::Push {
                    channel_id: channel.clone(),
                    message,
                };
                if !Self::reply(&outbox, &frame) {
                    break;
                }
            }
        });

        ChannelFeed {
            subscriber_id,
            forwarder,
        }
    }

    async fn close_feed(&self, channel_id: &str, feed: ChannelFeed) {
        feed.forwarder.abort();
        self.backend.unsubscribe(channel_id, &feed.subscriber_id).await;
    }

    async fn handle_disconnect(&self, session: &mut Session) {
        for (channel_id, feed) in session.feeds.drain() {
            self.close_feed(&channel_id, feed).await;
        }
        info!("Participant {} disconnected", session.participant_id);
    }

    fn reject(outbox: &Outbox, request_id: u64, message: &str) {
        Self::reply(
            outbox,
            &ServerFrame::Error {
                request_id: Some(request_id),
                message: message.to_string(),
            },
        );
    }

    /// Queues `frame` for the connection; `false` once the connection is gone.
    fn reply(outbox: &Outbox, frame: &ServerFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(msg) => outbox.send(WsMessage::text(msg)).is_ok(),
            Err(e) => {
                error!("Failed to encode frame: {}", e);
                true
            }
        }
    }
}

/// `/ws` upgrade route for the relay.
pub fn routes(
    server: Arc<Server>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("ws")
        .and(warp::ws())
        .map(move |ws: warp::ws::Ws| {
            let server = server.clone();
            ws.on_upgrade(move |socket| async move {
                server.handle_connection(socket).await;
            })
        })
        .with(warp::cors().allow_any_origin())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn recv_frame(client: &mut warp::test::WsClient) -> ServerFrame {
        let msg = client.recv().await.unwrap();
        serde_json::from_str(msg.to_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn echoes_sent_message_to_subscriber() {
        let server = Arc::new(Server::default());
        let mut client = warp::test::ws()
            .path("/ws")
            .handshake(routes(server.clone()))
            .await
            .expect("handshake");

        client.send_text(json!({"type": "hello", "user_id": "riya"}).to_string()).await;
        client
            .send_text(json!({"type": "subscribe", "request_id": 1, "channel_id": "global"}).to_string())
            .await;
        assert_eq!(recv_frame(&mut client).await, ServerFrame::Ack { request_id: 1 });

        client
            .send_text(
                json!({"type": "send_message", "request_id": 2, "channel_id": "global", "text": "hi"})
                    .to_string(),
            )
            .await;

        let mut saw_ack = false;
        let mut saw_push = false;
        for _ in 0..2 {
            match recv_frame(&mut client).await {
                ServerFrame::Ack { request_id: 2 } => saw_ack = true,
                ServerFrame::Push { channel_id, message } => {
                    assert_eq!(channel_id, "global");
                    assert_eq!(message.text, "hi");
                    assert_eq!(message.sender_id, "riya");
                    saw_push = true;
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert!(saw_ack && saw_push);
        assert_eq!(server.backend().messages("global").await.len(), 1);
    }

    #[tokio::test]
    async fn delete_is_acked_for_author_and_rejected_for_others() {
        let server = Arc::new(Server::default());
        let mut author = warp::test::ws()
            .path("/ws")
            .handshake(routes(server.clone()))
            .await
            .expect("handshake");
        let mut other = warp::test::ws()
            .path("/ws")
            .handshake(routes(server.clone()))
            .await
            .expect("handshake");

        author.send_text(json!({"type": "hello", "user_id": "riya"}).to_string()).await;
        other.send_text(json!({"type": "hello", "user_id": "arjun"}).to_string()).await;
        author
            .send_text(
                json!({"type": "send_message", "request_id": 1, "channel_id": "random", "text": "typo"})
                    .to_string(),
            )
            .await;
        assert_eq!(recv_frame(&mut author).await, ServerFrame::Ack { request_id: 1 });

        let id = server.backend().messages("random").await[0].id.to_string();
        other
            .send_text(json!({"type": "delete_message", "request_id": 2, "message_id": id}).to_string())
            .await;
        match recv_frame(&mut other).await {
            ServerFrame::Error { request_id, .. } => assert_eq!(request_id, Some(2)),
            frame => panic!("unexpected frame {frame:?}"),
        }

        author
            .send_text(json!({"type": "delete_message", "request_id": 3, "message_id": id}).to_string())
            .await;
        assert_eq!(recv_frame(&mut author).await, ServerFrame::Ack { request_id: 3 });
        assert!(server.backend().messages("random").await.is_empty());
    }

    #[tokio::test]
    async fn send_without_hello_is_rejected() {
        let server = Arc::new(Server::default());
        let mut client = warp::test::ws()
            .path("/ws")
            .handshake(routes(server))
            .await
            .expect("handshake");

        client
            .send_text(
                json!({"type": "send_message", "request_id": 9, "channel_id": "global", "text": "hi"})
                    .to_string(),
            )
            .await;

        match recv_frame(&mut client).await {
            ServerFrame::Error { request_id, .. } => assert_eq!(request_id, Some(9)),
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
