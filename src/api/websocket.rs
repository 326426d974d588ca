//! WebSocket handler for operator real-time delivery
//!
//! Connections authenticate at upgrade with a session token; nothing is
//! delivered before auth. Every room name is built server-side from the
//! authenticated tenant, so a client can only ever join rooms inside its
//! own tenant.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::ApiState;
use crate::db::AuthedUser;
use crate::fanout::{conversation_room, tenant_room, Backbone, Event};

/// Query parameters for the WebSocket upgrade
#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// Incoming WebSocket message from an operator client
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsIncoming {
    /// Subscribe to a conversation's events
    ConversationJoin { conversation_id: i64 },
    /// Unsubscribe from a conversation
    ConversationLeave { conversation_id: i64 },
    /// Relay a typing indicator to the conversation room
    ConversationTyping {
        conversation_id: i64,
        typing: bool,
    },
    /// Keep-alive
    Ping,
}

/// Control messages sent to the client (room events are forwarded as-is)
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsOutgoing {
    Connected { user_id: i64 },
    Pong,
    Error { code: String, message: String },
}

/// One frame on the outgoing channel
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WsFrame {
    Control(WsOutgoing),
    Event(Event),
}

/// Build the WebSocket router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new().route("/ws", get(ws_upgrade)).with_state(state)
}

async fn ws_upgrade(
    State(state): State<Arc<ApiState>>,
    query: Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = query.0.token;
    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

async fn handle_socket(socket: WebSocket, state: Arc<ApiState>, token: Option<String>) {
    let (mut sender, mut receiver) = socket.split();

    // Auth before anything is delivered
    let user = match authenticate(&state, token.as_deref()) {
        Some(user) => user,
        None => {
            tracing::warn!("WebSocket auth failed, closing");
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    tracing::info!(user_id = user.user_id, tenant_id = user.tenant_id, "WebSocket connected");

    let (tx, mut rx) = mpsc::channel::<WsFrame>(32);

    let _ = tx
        .send(WsFrame::Control(WsOutgoing::Connected { user_id: user.user_id }))
        .await;

    // Presence: join the tenant room and announce
    let mut rooms = RoomSet::new(Arc::clone(&state), tx.clone());
    rooms.join(tenant_room(user.tenant_id));
    state.hub.publish(
        &tenant_room(user.tenant_id),
        Event::UserOnline { user_id: user.user_id },
    );

    // Forward frames from the channel to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Ok(text) = serde_json::to_string(&frame) {
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    // Handle client intents
    let recv_state = Arc::clone(&state);
    let recv_tx = tx.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_intent(&recv_state, &user, &text, &recv_tx, &mut rooms).await;
                }
                Message::Close(_) => {
                    tracing::info!(user_id = user.user_id, "WebSocket closed by client");
                    break;
                }
                _ => {}
            }
        }
        rooms.leave_all();
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

fn authenticate(state: &ApiState, token: Option<&str>) -> Option<AuthedUser> {
    let token = token?;
    state.sessions.authenticate(token).ok().flatten()
}

async fn handle_intent(
    state: &Arc<ApiState>,
    user: &AuthedUser,
    text: &str,
    tx: &mpsc::Sender<WsFrame>,
    rooms: &mut RoomSet,
) {
    let incoming: WsIncoming = match serde_json::from_str(text) {
        Ok(incoming) => incoming,
        Err(e) => {
            let _ = tx
                .send(WsFrame::Control(WsOutgoing::Error {
                    code: "bad_message".to_string(),
                    message: e.to_string(),
                }))
                .await;
            return;
        }
    };

    match incoming {
        WsIncoming::ConversationJoin { conversation_id } => {
            if !conversation_in_tenant(state, user.tenant_id, conversation_id) {
                let _ = tx
                    .send(WsFrame::Control(WsOutgoing::Error {
                        code: "not_found".to_string(),
                        message: format!("conversation {conversation_id} not found"),
                    }))
                    .await;
                return;
            }

            rooms.join(conversation_room(user.tenant_id, conversation_id));

            // Opening a conversation clears its unread badge
            if let Err(e) = state.conversations.mark_read(conversation_id) {
                tracing::warn!(conversation_id, error = %e, "mark read failed");
            }
        }
        WsIncoming::ConversationLeave { conversation_id } => {
            rooms.leave(&conversation_room(user.tenant_id, conversation_id));
        }
        WsIncoming::ConversationTyping {
            conversation_id,
            typing,
        } => {
            if !conversation_in_tenant(state, user.tenant_id, conversation_id) {
                return;
            }
            state.hub.publish(
                &conversation_room(user.tenant_id, conversation_id),
                Event::ConversationTyping {
                    conversation_id,
                    user_id: Some(user.user_id),
                    typing,
                },
            );
        }
        WsIncoming::Ping => {
            let _ = tx.send(WsFrame::Control(WsOutgoing::Pong)).await;
        }
    }
}

fn conversation_in_tenant(state: &ApiState, tenant_id: i64, conversation_id: i64) -> bool {
    state
        .conversations
        .find(conversation_id)
        .ok()
        .flatten()
        .is_some_and(|c| c.tenant_id == tenant_id)
}

/// Room subscriptions held by one connection
struct RoomSet {
    state: Arc<ApiState>,
    tx: mpsc::Sender<WsFrame>,
    forwards: HashMap<String, JoinHandle<()>>,
}

impl RoomSet {
    fn new(state: Arc<ApiState>, tx: mpsc::Sender<WsFrame>) -> Self {
        Self {
            state,
            tx,
            forwards: HashMap::new(),
        }
    }

    /// Subscribe to a room, forwarding its events onto the outgoing channel
    fn join(&mut self, room: String) {
        if self.forwards.contains_key(&room) {
            return;
        }

        let mut rx = self.state.hub.subscribe(&room);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if tx.send(WsFrame::Event(event)).await.is_err() {
                    break;
                }
            }
        });

        self.forwards.insert(room, handle);
    }

    fn leave(&mut self, room: &str) {
        if let Some(handle) = self.forwards.remove(room) {
            handle.abort();
        }
    }

    fn leave_all(&mut self) {
        for (_, handle) in self.forwards.drain() {
            handle.abort();
        }
    }
}

impl Drop for RoomSet {
    fn drop(&mut self) {
        self.leave_all();
    }
}
