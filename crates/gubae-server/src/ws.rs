//! WebSocket endpoint for live delivery and presence.
//!
//! ```text
//! client ──subscribe──> Connection ──> ChatService::subscribe ──> Subscription ─┐
//!                          │                                                    │
//!                          ├── catch-up: history after `after_seq` ──> history  │
//!                          ├── pushed messages (deduplicated by seq) <──────────┘
//!                          └── EventBus events the caller may see ──> event
//! ```
//!
//! Frames are JSON text by default. A client that sends a binary frame gets
//! bincode-encoded binary frames from then on.

use std::collections::HashMap;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::stream::SelectAll;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use gubae_chat::{ChatEvent, Subscription};
use gubae_shared::{Caller, ClientId, ConversationId};
use gubae_store::{Message, MessageView};

use crate::api::AppState;
use crate::error::ApiError;
use crate::identity::Identity;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ClientFrame {
    /// Start live delivery. With `after_seq`, everything after it is sent
    /// first as `history` frames.
    Subscribe {
        conversation_id: ConversationId,
        #[serde(default)]
        after_seq: Option<u64>,
    },
    Unsubscribe {
        conversation_id: ConversationId,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ServerFrame {
    Subscribed {
        conversation_id: ConversationId,
        /// Highest sequence number already sent for the conversation.
        last_seq: u64,
    },
    History(MessageView),
    Message(Message),
    Event(ChatEvent),
    Error {
        code: String,
        message: String,
    },
    Pong,
}

impl ServerFrame {
    fn error(e: ApiError) -> Self {
        ServerFrame::Error {
            code: e.code().to_string(),
            message: e.public_message(),
        }
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Identity(caller): Identity,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, caller))
}

async fn handle_socket(socket: WebSocket, state: AppState, caller: Caller) {
    let (mut sink, mut receiver) = socket.split();
    let (outbox, mut outbound) = mpsc::channel::<Outbound>(OUTBOX_CAPACITY);

    // Frames are encoded and written here so a long catch-up never holds
    // more than the outbox in memory.
    let writer = tokio::spawn(async move {
        while let Some((frame, binary)) = outbound.recv().await {
            let Some(message) = encode(&frame, binary) else {
                continue;
            };
            if let Err(e) = sink.send(message).await {
                debug!(error = %e, "WebSocket send failed");
                break;
            }
        }
    });

    let mut conn = Connection::new(state, caller, outbox);
    if let Err(e) = conn.state.chat.connect(&conn.caller) {
        warn!(error = %e, "Failed to mark caller online");
    }
    info!(user = %conn.caller.user_id, client = %conn.client, "WebSocket connection established");

    let mut events = conn.state.chat.subscribe_events();

    loop {
        let open = tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    conn.binary = false;
                    match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(frame) => conn.handle_frame(frame).await,
                        Err(e) => conn.send(ServerFrame::error(ApiError::BadRequest(e.to_string()))).await,
                    }
                }
                Some(Ok(WsMessage::Binary(bytes))) => {
                    conn.binary = true;
                    match bincode::deserialize::<ClientFrame>(&bytes) {
                        Ok(frame) => conn.handle_frame(frame).await,
                        Err(e) => conn.send(ServerFrame::error(ApiError::BadRequest(e.to_string()))).await,
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => false,
                // Protocol-level ping/pong is answered by axum.
                Some(Ok(_)) => true,
                Some(Err(e)) => {
                    debug!(error = %e, "WebSocket receive failed");
                    false
                }
            },
            Some(message) = conn.subscriptions.next(), if !conn.subscriptions.is_empty() => {
                match conn.accept_push(message) {
                    Some(frame) => conn.send(frame).await,
                    None => true,
                }
            }
            event = events.recv() => match event {
                Ok(event) => match conn.filter_event(event) {
                    Some(frame) => conn.send(frame).await,
                    None => true,
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(user = %conn.caller.user_id, skipped, "Event stream lagged");
                    true
                }
                Err(RecvError::Closed) => false,
            },
        };
        if !open {
            break;
        }
    }

    conn.close();
    drop(conn);
    if let Err(e) = writer.await {
        debug!(error = %e, "WebSocket writer task failed");
    }
}

fn encode(frame: &ServerFrame, binary: bool) -> Option<WsMessage> {
    let encoded = if binary {
        bincode::serialize(frame).map(WsMessage::Binary).map_err(|e| e.to_string())
    } else {
        serde_json::to_string(frame).map(WsMessage::Text).map_err(|e| e.to_string())
    };
    match encoded {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(error = %e, "Failed to encode server frame");
            None
        }
    }
}

/// A frame queued for the socket writer, with the encoding to use.
type Outbound = (ServerFrame, bool);

const OUTBOX_CAPACITY: usize = 64;

/// Per-socket state. Owns every subscription it creates.
struct Connection {
    state: AppState,
    caller: Caller,
    client: ClientId,
    binary: bool,
    outbox: mpsc::Sender<Outbound>,
    subscriptions: SelectAll<Subscription>,
    /// Highest sequence number sent per subscribed conversation.
    last_seq: HashMap<ConversationId, u64>,
}

impl Connection {
    fn new(state: AppState, caller: Caller, outbox: mpsc::Sender<Outbound>) -> Self {
        Self {
            state,
            caller,
            client: ClientId::new(),
            binary: false,
            outbox,
            subscriptions: SelectAll::new(),
            last_seq: HashMap::new(),
        }
    }

    /// Queue a frame for the socket. `false` once the writer is gone.
    async fn send(&self, frame: ServerFrame) -> bool {
        if self.outbox.send((frame, self.binary)).await.is_err() {
            debug!(client = %self.client, "WebSocket writer closed");
            return false;
        }
        true
    }

    async fn handle_frame(&mut self, frame: ClientFrame) -> bool {
        match frame {
            ClientFrame::Subscribe {
                conversation_id,
                after_seq,
            } => self.subscribe(conversation_id, after_seq).await,
            ClientFrame::Unsubscribe { conversation_id } => {
                self.state.chat.unsubscribe(conversation_id, self.client);
                self.last_seq.remove(&conversation_id);
                true
            }
            ClientFrame::Ping => self.send(ServerFrame::Pong).await,
        }
    }

    /// Subscribe before reading history so nothing falls between the two;
    /// pushes already covered by history are dropped in `accept_push`.
    /// History is sent page by page as it is read.
    async fn subscribe(&mut self, conversation: ConversationId, after_seq: Option<u64>) -> bool {
        let subscription = match self
            .state
            .chat
            .subscribe(conversation, &self.caller, self.client)
        {
            Ok(s) => s,
            Err(e) => return self.send(ServerFrame::error(e.into())).await,
        };

        let mut last = after_seq.unwrap_or(0);
        if let Some(after) = after_seq {
            let history = match self.state.chat.history(conversation, &self.caller, after) {
                Ok(h) => h,
                Err(e) => return self.send(ServerFrame::error(e.into())).await,
            };
            let mut history = Box::pin(history);
            while let Some(item) = history.next().await {
                let frame = match item {
                    Ok(view) => {
                        last = view.message.seq;
                        ServerFrame::History(view)
                    }
                    Err(e) => ServerFrame::error(e.into()),
                };
                let failed = matches!(frame, ServerFrame::Error { .. });
                if !self.send(frame).await {
                    return false;
                }
                if failed {
                    break;
                }
            }
        }

        self.last_seq.insert(conversation, last);
        self.subscriptions.push(subscription);
        debug!(conversation = %conversation, client = %self.client, last_seq = last, "WebSocket subscribed");
        self.send(ServerFrame::Subscribed {
            conversation_id: conversation,
            last_seq: last,
        })
        .await
    }

    fn accept_push(&mut self, message: Message) -> Option<ServerFrame> {
        let last = self.last_seq.get_mut(&message.conversation_id)?;
        if message.seq <= *last {
            return None;
        }
        *last = message.seq;
        Some(ServerFrame::Message(message))
    }

    /// Appended messages arrive through subscriptions, not as events.
    fn filter_event(&self, event: ChatEvent) -> Option<ServerFrame> {
        let visible = match &event {
            ChatEvent::MessageAppended(_) => false,
            ChatEvent::PresenceChanged { user_id, .. } => {
                *user_id != self.caller.user_id
                    && self.state.chat.presence(&self.caller, user_id).is_ok()
            }
            ChatEvent::MembershipChanged { user_id, .. } if *user_id == self.caller.user_id => true,
            other => other.conversation_id().is_some_and(|c| {
                self.last_seq.contains_key(&c) && self.state.chat.can_read(c, &self.caller)
            }),
        };
        visible.then_some(ServerFrame::Event(event))
    }

    fn close(&mut self) {
        self.subscriptions = SelectAll::new();
        if let Err(e) = self.state.chat.disconnect(&self.caller, self.client) {
            warn!(error = %e, "Failed to mark caller offline");
        }
        info!(user = %self.caller.user_id, client = %self.client, "WebSocket connection closed");
    }
}
