//! One MCP session: the state machine and the loop that drives it for a single connection.
//!
//! A [`Session`] owns its [`Peer`] exclusively and processes messages strictly one at a time, so
//! the session is the only writer of its own state.  Everything outside the session (the server's
//! registry, cleanup, shutdown) sees it through a shared [`SessionHandle`], which exposes the
//! state read-only along with the cancellation token used to stop the session.
//!
//! The loop is a timed poll: ask the peer for the next message with a receive timeout, process at
//! most one message per iteration, and sleep for a short poll interval when nothing is ready.  A
//! receive timeout is not an error; it is simply the point at which timers and cancellation are
//! checked again.
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use picomcp_jsonrpc::{
    FrameCodec, FrameError, Id, Inbound, JsonRpcError, Notification, Peer, Received, Request, Response,
    ResponsePayload, Transport, parse_message,
};
use strum::{Display, FromRepr, IntoStaticStr};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::router::{self, McpMethod, McpNotification, Route};
use crate::{ServerConfig, ToolRegistry};

mod budget;
mod handlers;

pub use budget::{BudgetExceeded, ErrorBudget};

/// Where a session is in the MCP lifecycle.
///
/// `Shutdown` and `Error` are terminal: a session in either state processes nothing further and
/// its transport has been closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, FromRepr, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    Uninitialized = 0,
    Initializing = 1,
    Initialized = 2,
    Active = 3,
    Shutdown = 4,
    Error = 5,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Shutdown | SessionState::Error)
    }

    /// The handshake has completed and tools may be used.
    pub fn is_ready(self) -> bool {
        matches!(self, SessionState::Initialized | SessionState::Active)
    }

    pub fn is_open(self) -> bool {
        !self.is_terminal()
    }
}

/// Why the session loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum CloseReason {
    PeerClosed,
    ForeignProtocol,
    FrameTooLarge,
    ErrorBudgetExhausted,
    IdleTimeout,
    TransportFailure,
    SerializationFailure,
    Cancelled,
}

impl CloseReason {
    /// The terminal state a session ends in for this reason.
    pub fn final_state(self) -> SessionState {
        match self {
            CloseReason::SerializationFailure => SessionState::Error,
            _ => SessionState::Shutdown,
        }
    }
}

/// What the client said about itself in `initialize`.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
    /// The client's declared capabilities, verbatim.  An empty object if none were sent.
    pub capabilities: picomcp_jsonrpc::JsonValue,
    /// The protocol version the client asked for.
    pub protocol_version: Option<String>,
}

/// Shared, read-mostly view of a running session.
#[derive(Debug)]
pub struct SessionHandle {
    id: Uuid,
    remote_peer: String,
    state: AtomicU8,
    created_at: Instant,
    client_info: OnceLock<ClientInfo>,
    cancellation_token: CancellationToken,
}

impl SessionHandle {
    fn new(remote_peer: String, cancellation_token: CancellationToken) -> Self {
        Self {
            id: Uuid::now_v7(),
            remote_peer,
            state: AtomicU8::new(SessionState::Uninitialized as u8),
            created_at: Instant::now(),
            client_info: OnceLock::new(),
            cancellation_token,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_peer(&self) -> &str {
        &self.remote_peer
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_repr(self.state.load(Ordering::Acquire)).unwrap_or(SessionState::Error)
    }

    /// Only the session itself, or the task that ran it, changes the state.
    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Client details from the first successful `initialize`, if there has been one.
    pub fn client_info(&self) -> Option<&ClientInfo> {
        self.client_info.get()
    }

    /// Ask the session to stop.  It closes its transport and ends in `Shutdown`.
    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }
}

/// A response to send, and the state to move to once it has actually been sent.
struct Outcome {
    payload: ResponsePayload,
    commit: Option<SessionState>,
}

impl Outcome {
    fn ok(result: picomcp_jsonrpc::JsonValue) -> Self {
        Self {
            payload: ResponsePayload::success(result),
            commit: None,
        }
    }

    fn error(details: impl Into<picomcp_jsonrpc::ErrorDetails>) -> Self {
        Self {
            payload: ResponsePayload::error(details),
            commit: None,
        }
    }

    fn committing(mut self, state: SessionState) -> Self {
        self.commit = Some(state);
        self
    }
}

pub struct Session<T: Transport> {
    peer: Peer<T>,
    handle: Arc<SessionHandle>,
    config: Arc<ServerConfig>,
    tools: Arc<ToolRegistry>,
    budget: ErrorBudget,
    last_activity: Instant,
    serialization_failures: u32,
    /// How many upcoming responses fail to serialize.
    #[cfg(test)]
    failing_serializations: u32,
}

impl<T: Transport> Session<T> {
    /// Set up a session over `transport`.  Nothing is read until [`Self::run`].
    ///
    /// Cancelling `cancellation_token` stops the session; the server passes a child of its own
    /// token so that shutdown reaches every session.
    pub fn new(
        transport: T,
        config: Arc<ServerConfig>,
        tools: Arc<ToolRegistry>,
        cancellation_token: CancellationToken,
    ) -> Self {
        let session_config = &config.session;
        let codec = FrameCodec::new(session_config.framing, session_config.max_frame_len);
        let peer = Peer::new(transport, codec);
        let handle = Arc::new(SessionHandle::new(peer.remote_peer().to_string(), cancellation_token));
        let budget = ErrorBudget::new(session_config.max_errors_per_second, session_config.max_total_errors);

        Self {
            peer,
            handle,
            config,
            tools,
            budget,
            last_activity: Instant::now(),
            serialization_failures: 0,
            #[cfg(test)]
            failing_serializations: 0,
        }
    }

    pub fn handle(&self) -> Arc<SessionHandle> {
        self.handle.clone()
    }

    /// Close the connection without serving it.
    pub async fn reject(mut self) {
        self.peer.close().await;
        self.handle.set_state(SessionState::Shutdown);
    }

    /// Serve the connection until it closes, fails, or is cancelled, and return the final state.
    ///
    /// The transport is always closed by the time this returns.
    pub async fn run(mut self) -> SessionState {
        let span = tracing::info_span!(
            "session",
            session_id = %self.handle.id(),
            remote_peer = %self.handle.remote_peer()
        );

        async move {
            tracing::info!("Session started");

            let reason = self.event_loop().await;
            let final_state = reason.final_state();

            self.peer.close().await;
            self.handle.set_state(final_state);

            let termination_reason: &'static str = reason.into();
            tracing::info!(
                termination_reason,
                state = %final_state,
                errors = self.budget.total(),
                "Session ended"
            );
            final_state
        }
        .instrument(span)
        .await
    }

    async fn event_loop(&mut self) -> CloseReason {
        let cancellation_token = self.handle.cancellation_token().clone();
        let receive_timeout = self.config.session.receive_timeout;
        let poll_interval = self.config.session.poll_interval;

        loop {
            let received = tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => break CloseReason::Cancelled,
                received = self.peer.receive(receive_timeout) => received,
            };

            match received {
                Ok(Received::Message(raw)) => {
                    self.last_activity = Instant::now();
                    if let ControlFlow::Break(reason) = self.handle_message(&raw).await {
                        break reason;
                    }
                    tokio::task::yield_now().await;
                }
                Ok(Received::Idle) => {
                    if self.idle_expired() {
                        tracing::info!(idle_for = ?self.last_activity.elapsed(), "Session is idle; closing");
                        break CloseReason::IdleTimeout;
                    }
                    tokio::time::sleep(poll_interval).await;
                }
                Ok(Received::Closed) => break CloseReason::PeerClosed,
                Err(JsonRpcError::Frame {
                    source: FrameError::FrameTooLarge { len, max },
                }) => {
                    tracing::warn!(len, max, "Peer sent an oversized frame; closing");
                    break CloseReason::FrameTooLarge;
                }
                Err(JsonRpcError::Frame {
                    source: FrameError::InvalidUtf8 { source },
                }) => {
                    tracing::debug!(err = %source, "Frame is not valid UTF-8");
                    self.last_activity = Instant::now();
                    let response = Response::error(Id::Null, picomcp_jsonrpc::ErrorDetails::parse_error("Parse error", None));
                    if let ControlFlow::Break(reason) = self.respond(response, None).await {
                        break reason;
                    }
                }
                Err(e) => {
                    tracing::error!(err = %e, "Failed to read from the remote peer");
                    break CloseReason::TransportFailure;
                }
            }
        }
    }

    fn idle_expired(&self) -> bool {
        self.config
            .session
            .idle_timeout
            .is_some_and(|idle_timeout| self.last_activity.elapsed() >= idle_timeout)
    }

    async fn handle_message(&mut self, raw: &str) -> ControlFlow<CloseReason> {
        tracing::trace!(bytes = raw.len(), "Received message");

        match parse_message(raw) {
            Ok(Inbound::Request(request)) => self.handle_request(request).await,
            Ok(Inbound::Notification(notification)) => {
                self.handle_notification(notification);
                ControlFlow::Continue(())
            }
            Ok(Inbound::Response { id }) => {
                tracing::debug!(request_id = %id, "Ignoring response from the client; this server sends no requests");
                ControlFlow::Continue(())
            }
            Err(rejection) if rejection.closes_connection() => {
                tracing::warn!(reason = %rejection, "Peer is not speaking JSON-RPC; closing");
                ControlFlow::Break(CloseReason::ForeignProtocol)
            }
            Err(rejection) => match rejection.error_response() {
                Some(response) => {
                    tracing::debug!(reason = %rejection, "Rejected message");
                    self.respond(response, None).await
                }
                None => ControlFlow::Continue(()),
            },
        }
    }

    async fn handle_request(&mut self, request: Request) -> ControlFlow<CloseReason> {
        let Request { id, method, params } = request;

        let outcome = match router::route(&method, self.handle.state()) {
            Route::Reject(details) => {
                tracing::debug!(%method, request_id = %id, code = details.code.code(), "Request rejected");
                Outcome::error(details)
            }
            Route::Dispatch(mcp_method) => {
                tracing::debug!(%method, request_id = %id, "Dispatching request");
                match mcp_method {
                    McpMethod::Initialize => self.initialize(params.as_ref()),
                    McpMethod::ToolsList => self.list_tools(params.as_ref()),
                    McpMethod::ToolsCall => self.call_tool(&id, params).await,
                    McpMethod::Ping => Outcome::ok(picomcp_jsonrpc::JsonValue::object()),
                }
            }
        };

        self.respond(Response::new(id, outcome.payload), outcome.commit).await
    }

    fn handle_notification(&mut self, notification: Notification) {
        let method = notification.method.as_str();

        match method.parse::<McpNotification>() {
            Ok(McpNotification::Initialized) => match self.handle.state() {
                SessionState::Initialized => self.transition(SessionState::Active),
                state => tracing::debug!(%state, "Ignoring initialized notification"),
            },
            Ok(McpNotification::Cancelled) => {
                let request_id = notification
                    .params
                    .as_ref()
                    .and_then(|params| params.get("requestId"))
                    .map(|id| id.to_compact_string());
                // Requests are processed one at a time, so the one being cancelled has already
                // been answered by the time this is read.
                tracing::debug!(?request_id, "Cancellation for a request that is no longer running");
            }
            Err(_) if method.parse::<McpMethod>().is_ok() => {
                tracing::debug!(%method, "Ignoring request method sent as a notification");
            }
            Err(_) => tracing::debug!(%method, "Ignoring unknown notification"),
        }
    }

    /// Serialize and send a response, then apply the committed state transition, if any.
    ///
    /// The transition only happens once the response is on the wire.
    async fn respond(&mut self, response: Response, commit: Option<SessionState>) -> ControlFlow<CloseReason> {
        let send_timeout = self.config.session.send_timeout;
        let is_error = response.is_error();

        let text = match self.serialize(&response) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(err = %e, request_id = %response.id, "Failed to serialize response");
                self.serialization_failures += 1;
                self.send_fallback(&response.id).await?;
                if self.serialization_failures > 1 {
                    return ControlFlow::Break(CloseReason::SerializationFailure);
                }
                return ControlFlow::Continue(());
            }
        };

        match self.peer.send(&text, send_timeout).await {
            Ok(()) => {
                tracing::trace!(request_id = %response.id, bytes = text.len(), "Sent response");
            }
            Err(JsonRpcError::Frame { source }) => {
                tracing::warn!(err = %source, request_id = %response.id, "Response cannot be framed");
                return self.send_fallback(&response.id).await;
            }
            Err(e) => {
                tracing::error!(err = %e, request_id = %response.id, "Failed to send response");
                return ControlFlow::Break(CloseReason::TransportFailure);
            }
        }

        if let Some(state) = commit {
            self.transition(state);
        }

        if is_error {
            self.charge_error()
        } else {
            ControlFlow::Continue(())
        }
    }

    fn serialize(&mut self, response: &Response) -> picomcp_jsonrpc::Result<String> {
        #[cfg(test)]
        if self.failing_serializations > 0 {
            self.failing_serializations -= 1;
            return Err(JsonRpcError::SerResponse {
                source: <serde_json::Error as serde::ser::Error>::custom("serializer refused the response"),
                type_name: std::any::type_name::<Response>(),
            });
        }

        response.to_json_string()
    }

    /// Make the next `count` responses fail to serialize.
    #[cfg(test)]
    pub(crate) fn fail_serializations(&mut self, count: u32) {
        self.failing_serializations = count;
    }

    /// Answer with the hand-built internal error envelope, undoing a half-finished handshake.
    async fn send_fallback(&mut self, id: &Id) -> ControlFlow<CloseReason> {
        if self.handle.state() == SessionState::Initializing {
            self.transition(SessionState::Uninitialized);
        }

        let envelope = Response::fallback_error(id);
        if let Err(e) = self.peer.send(&envelope, self.config.session.send_timeout).await {
            tracing::error!(err = %e, request_id = %id, "Failed to send fallback error");
            return ControlFlow::Break(CloseReason::TransportFailure);
        }

        self.charge_error()
    }

    fn charge_error(&mut self) -> ControlFlow<CloseReason> {
        match self.budget.charge(Instant::now()) {
            Ok(()) => ControlFlow::Continue(()),
            Err(exceeded) => {
                tracing::warn!(%exceeded, "Error budget exhausted; closing");
                ControlFlow::Break(CloseReason::ErrorBudgetExhausted)
            }
        }
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.handle.state();
        if from != to {
            tracing::debug!(%from, %to, "Session state transition");
            self.handle.set_state(to);
        }
    }
}
