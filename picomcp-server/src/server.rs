//! The TCP front end: accept connections, enforce the connection cap, and run one session task per
//! connection.
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use picomcp_jsonrpc::{StreamTransport, Transport};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::panic_err_to_string;
use crate::session::{Session, SessionHandle, SessionState};
use crate::{Result, ServerConfig, ServerError, SessionRegistry, ToolRegistry};

/// Pause after a failed `accept` so a persistent failure (out of file descriptors, say) doesn't
/// turn into a hot loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// An MCP server: configuration, the tools it offers, and the sessions it is running.
///
/// Cloning is cheap and every clone refers to the same server, so one clone can call
/// [`Server::shutdown`] while another is inside [`Server::serve`].
#[derive(Clone, Debug)]
pub struct Server {
    config: Arc<ServerConfig>,
    tools: Arc<ToolRegistry>,
    sessions: Arc<SessionRegistry>,
    cancellation_token: CancellationToken,
}

impl Server {
    pub fn new(config: ServerConfig, tools: impl Into<Arc<ToolRegistry>>) -> Result<Self> {
        config.validate()?;

        let sessions = Arc::new(SessionRegistry::new(config.max_connections));
        Ok(Self {
            config: Arc::new(config),
            tools: tools.into(),
            sessions,
            cancellation_token: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.listen_addr;
        TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })
    }

    /// Accept connections on `listener` until [`Self::shutdown`] is called.
    ///
    /// Finished sessions are swept from the registry every `cleanup_interval`.  When this returns,
    /// every session has been asked to stop, but some may still be closing.
    pub async fn serve(&self, listener: TcpListener) {
        let local_addr = listener.local_addr().ok();
        tracing::info!(
            ?local_addr,
            max_connections = self.config.max_connections,
            tools = self.tools.len(),
            "Listening for connections"
        );

        let mut cleanup = tokio::time::interval(self.config.cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    tracing::info!("Server is shutting down; no longer accepting connections");
                    break;
                },
                _ = cleanup.tick() => {
                    let removed = self.sessions.cleanup_finished();
                    if removed > 0 {
                        tracing::debug!(removed, remaining = self.sessions.len(), "Removed finished sessions");
                    }
                },
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            match self.serve_connection(StreamTransport::from_tcp(stream)) {
                                Ok(running) => {
                                    tracing::debug!(%remote_addr, session_id = %running.handle().id(), "Accepted connection");
                                }
                                Err(e) => {
                                    tracing::warn!(%remote_addr, err = %e, "Refusing connection");
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(err = %e, "Failed to accept connection");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                }
            }
        }

        let signalled = self.sessions.shutdown_all();
        tracing::debug!(signalled, "Asked running sessions to stop");
    }

    /// Start a session over an already-connected transport in its own task.
    ///
    /// Fails, closing the transport, if the server is at its connection limit or shutting down.
    pub fn serve_connection<T: Transport>(&self, transport: T) -> Result<RunningSession> {
        let session = Session::new(
            transport,
            self.config.clone(),
            self.tools.clone(),
            self.cancellation_token.child_token(),
        );
        let handle = session.handle();

        let admitted = if self.cancellation_token.is_cancelled() {
            Err(ServerError::Cancelled)
        } else {
            self.sessions.try_add(handle.clone())
        };
        if let Err(e) = admitted {
            tokio::spawn(session.reject());
            return Err(e);
        }

        let sessions = self.sessions.clone();
        let task_handle = handle.clone();
        let task = tokio::spawn(async move {
            let final_state = match AssertUnwindSafe(session.run()).catch_unwind().await {
                Ok(state) => state,
                Err(panic) => {
                    tracing::error!(
                        session_id = %task_handle.id(),
                        remote_peer = %task_handle.remote_peer(),
                        panic = %panic_err_to_string(panic),
                        "Session panicked"
                    );
                    task_handle.set_state(SessionState::Error);
                    SessionState::Error
                }
            };
            sessions.remove(&task_handle.id());
            final_state
        });

        Ok(RunningSession { handle, task })
    }

    /// Stop accepting connections and cancel every session.
    pub fn shutdown(&self) {
        self.cancellation_token.cancel();
        self.sessions.shutdown_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

/// A session that has been started by [`Server::serve_connection`].
#[derive(Debug)]
pub struct RunningSession {
    handle: Arc<SessionHandle>,
    task: JoinHandle<SessionState>,
}

impl RunningSession {
    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    /// Wait for the session to finish and return its final state.
    pub async fn join(self) -> SessionState {
        match self.task.await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(session_id = %self.handle.id(), err = %e, "Session task failed");
                SessionState::Error
            }
        }
    }
}
