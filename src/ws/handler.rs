//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::{MatchHandle, PlayerInput};
use crate::util::rate_limit::PlayerRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg, MATCH_FULL};

/// WebSocket upgrade handler. Every connection is its own peer.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let user_id = Uuid::new_v4();
    info!(user_id = %user_id, "WebSocket upgrade");
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, user_id: Uuid, state: AppState) {
    info!(user_id = %user_id, "New WebSocket connection");

    let (mut ws_sink, ws_stream) = socket.split();

    // Send welcome message
    let welcome = ServerMsg::Welcome {
        user_id,
        server_time: unix_millis(),
    };

    if let Err(e) = send_msg(&mut ws_sink, &welcome).await {
        error!(user_id = %user_id, error = %e, "Failed to send welcome");
        return;
    }

    run_session(user_id, state, ws_sink, ws_stream).await;

    info!(user_id = %user_id, "WebSocket connection closed");
}

/// How far the join into the bound match has got
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinState {
    Pending,
    Joined,
    Rejected,
}

/// The match this session is bound to
struct JoinedMatch {
    handle: MatchHandle,
    forwarder: JoinHandle<()>,
    join_state: watch::Receiver<JoinState>,
}

impl JoinedMatch {
    /// A finished match or a refused join frees the session to join elsewhere
    fn is_stale(&self) -> bool {
        self.handle.input_tx.is_closed() || *self.join_state.borrow() == JoinState::Rejected
    }
}

/// Run the WebSocket session with read/write split
async fn run_session(
    user_id: Uuid,
    state: AppState,
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
) {
    let rate_limiter = PlayerRateLimiter::new();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMsg>(256);

    // Writer task: outbound queue -> WebSocket
    let writer_user_id = user_id;
    let writer_handle = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if let Err(e) = send_msg(&mut ws_sink, &msg).await {
                debug!(user_id = %writer_user_id, error = %e, "WebSocket send failed");
                break;
            }
        }
    });

    let mut joined: Option<JoinedMatch> = None;

    // Reader loop: WebSocket -> match loop
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if !rate_limiter.check_input() {
                    warn!(user_id = %user_id, "Rate limited input message");
                    continue;
                }

                let client_msg = match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(user_id = %user_id, error = %e, "Failed to parse client message");
                        continue;
                    }
                };

                if joined.as_ref().is_some_and(JoinedMatch::is_stale) {
                    if let Some(stale) = joined.take() {
                        debug!(user_id = %user_id, match_id = %stale.handle.id, "Unbinding from match");
                        stale.forwarder.abort();
                    }
                }

                if let ClientMsg::JoinMatch { match_id, .. } = &client_msg {
                    if joined.is_none() {
                        if !rate_limiter.check_join() {
                            warn!(user_id = %user_id, "Rate limited join request");
                            continue;
                        }
                        match state
                            .match_registry
                            .join_or_create(*match_id, state.config.match_settings)
                        {
                            Ok(handle) => {
                                let (join_tx, join_state) = watch::channel(JoinState::Pending);
                                let forwarder = spawn_forwarder(
                                    user_id,
                                    handle.snapshot_tx.subscribe(),
                                    out_tx.clone(),
                                    join_tx,
                                );
                                joined = Some(JoinedMatch {
                                    handle,
                                    forwarder,
                                    join_state,
                                });
                            }
                            Err(e) => {
                                warn!(user_id = %user_id, error = %e, "Join failed");
                                let _ = out_tx
                                    .send(ServerMsg::Error {
                                        code: "join_failed".to_string(),
                                        message: e.to_string(),
                                        recipient: None,
                                    })
                                    .await;
                                continue;
                            }
                        }
                    }
                }

                let Some(current) = joined.as_ref() else {
                    debug!(user_id = %user_id, "Input before joining a match");
                    continue;
                };

                let input = PlayerInput {
                    user_id,
                    msg: client_msg,
                    received_at: unix_millis(),
                };

                if current.handle.input_tx.send(input).await.is_err() {
                    debug!(user_id = %user_id, match_id = %current.handle.id, "Match input channel closed");
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(user_id = %user_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) => {
                debug!(user_id = %user_id, "Received ping");
            }
            Ok(Message::Pong(_)) => {
                debug!(user_id = %user_id, "Received pong");
            }
            Ok(Message::Close(_)) => {
                info!(user_id = %user_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(user_id = %user_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // Signal disconnect to match loop
    if let Some(current) = joined {
        let _ = current
            .handle
            .input_tx
            .send(PlayerInput {
                user_id,
                msg: ClientMsg::LeaveMatch,
                received_at: unix_millis(),
            })
            .await;
        current.forwarder.abort();
    }

    writer_handle.abort();
}

/// Forward match broadcasts to this session's outbound queue
fn spawn_forwarder(
    user_id: Uuid,
    mut snapshot_rx: broadcast::Receiver<ServerMsg>,
    out_tx: mpsc::Sender<ServerMsg>,
    join_tx: watch::Sender<JoinState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut view = SessionView::new(user_id);
        loop {
            match snapshot_rx.recv().await {
                Ok(msg) => {
                    let out = view.personalize(msg);
                    // Published before the client can see the outcome
                    let next = view.join_state;
                    join_tx.send_if_modified(|state| {
                        let changed = *state != next;
                        *state = next;
                        changed
                    });
                    for msg in out {
                        if out_tx.send(msg).await.is_err() {
                            return;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        user_id = %user_id,
                        lagged_count = n,
                        "Client lagged, skipping {} messages", n
                    );
                    // Continue - don't disconnect for lag
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(user_id = %user_id, "Match channel closed");
                    break;
                }
            }
        }
    })
}

/// One session's view of its match's broadcast
#[derive(Debug)]
struct SessionView {
    user_id: Uuid,
    actor_id: Option<Uuid>,
    join_state: JoinState,
}

impl SessionView {
    fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            actor_id: None,
            join_state: JoinState::Pending,
        }
    }

    /// Drop what is meant for other sessions and turn the match result into
    /// this session's own win/lose notification
    fn personalize(&mut self, msg: ServerMsg) -> Vec<ServerMsg> {
        let refused = matches!(
            &msg,
            ServerMsg::Error { code, recipient: Some(recipient), .. }
                if *recipient == self.user_id && code == MATCH_FULL
        );
        if refused && self.join_state == JoinState::Pending {
            self.join_state = JoinState::Rejected;
        }

        match msg {
            ServerMsg::MatchJoined {
                user_id, actor_id, ..
            } => {
                if user_id != self.user_id {
                    return Vec::new();
                }
                self.actor_id = Some(actor_id);
                self.join_state = JoinState::Joined;
                vec![msg]
            }
            ServerMsg::Physics { actor_id, .. } | ServerMsg::Presentation { actor_id, .. } => {
                if self.actor_id == Some(actor_id) {
                    vec![msg]
                } else {
                    Vec::new()
                }
            }
            ServerMsg::Error {
                recipient: Some(recipient),
                ..
            }
            | ServerMsg::Pong {
                recipient: Some(recipient),
                ..
            } if recipient != self.user_id => Vec::new(),
            ServerMsg::MatchEnd {
                winner_actor_id, ..
            } => {
                let won = winner_actor_id.is_some() && winner_actor_id == self.actor_id;
                vec![msg, ServerMsg::GameOver { won }]
            }
            other => vec![other],
        }
    }
}

/// Send a message over WebSocket
async fn send_msg(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMsg,
) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
