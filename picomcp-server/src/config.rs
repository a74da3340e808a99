//! Server and per-session configuration.
//!
//! Both structs deserialize from YAML (or any other `serde` format) with every field optional;
//! missing fields take the defaults documented on each field.  Durations are written in
//! `humantime` form such as `5s` or `250ms`.
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use picomcp_jsonrpc::{DEFAULT_MAX_FRAME_LEN, Framing};
use serde::{Deserialize, Serialize};

use crate::router::PROTOCOL_VERSION;
use crate::{Result, ServerError};

/// Smallest frame cap that still fits an `initialize` exchange.
const MIN_FRAME_LEN: usize = 256;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the TCP listener binds to.  Defaults to `0.0.0.0:8080`.
    pub listen_addr: SocketAddr,

    /// Maximum number of sessions serviced at once.  Connections beyond this are closed as soon
    /// as they are accepted.  Defaults to 3.
    pub max_connections: usize,

    /// Name and version reported in the `initialize` result.
    pub server_info: ServerInfo,

    /// Protocol version reported in the `initialize` result.
    pub protocol_version: String,

    /// Optional free-text usage instructions included in the `initialize` result.
    pub instructions: Option<String>,

    /// How often finished sessions are swept out of the session registry.
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,

    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            max_connections: 3,
            server_info: ServerInfo::default(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            instructions: None,
            cleanup_interval: Duration::from_secs(30),
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        fn invalid(reason: impl Into<String>) -> Result<()> {
            Err(ServerError::InvalidConfig { reason: reason.into() })
        }

        let session = &self.session;

        if self.max_connections == 0 {
            return invalid("max_connections must be at least 1");
        }
        if self.server_info.name.is_empty() {
            return invalid("server_info.name must not be empty");
        }
        if self.protocol_version.is_empty() {
            return invalid("protocol_version must not be empty");
        }
        if self.cleanup_interval.is_zero() {
            return invalid("cleanup_interval must be greater than zero");
        }
        if session.max_frame_len < MIN_FRAME_LEN || session.max_frame_len > u32::MAX as usize {
            return invalid(format!(
                "session.max_frame_len must be between {MIN_FRAME_LEN} and {}",
                u32::MAX
            ));
        }
        for (name, value) in [
            ("session.receive_timeout", session.receive_timeout),
            ("session.send_timeout", session.send_timeout),
            ("session.tool_timeout", session.tool_timeout),
        ] {
            if value.is_zero() {
                return invalid(format!("{name} must be greater than zero"));
            }
        }
        if session.idle_timeout.is_some_and(|t| t.is_zero()) {
            return invalid("session.idle_timeout must be greater than zero when set");
        }
        if session.max_errors_per_second == 0 || session.max_total_errors == 0 {
            return invalid("session error limits must be at least 1");
        }
        if session.tools_page_size == Some(0) {
            return invalid("session.tools_page_size must be at least 1 when set");
        }

        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: "picomcp".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// How messages are delimited on the wire.  Defaults to newline-delimited.
    pub framing: Framing,

    /// Largest frame accepted or sent, in bytes.  A peer that exceeds it is disconnected.
    /// Defaults to 16 KiB.
    pub max_frame_len: usize,

    /// How long one poll waits for bytes before the loop checks timers and cancellation again.
    /// Running out is not an error.
    #[serde(with = "humantime_serde")]
    pub receive_timeout: Duration,

    /// How long writing one response may take.  Exceeding it ends the session.
    #[serde(with = "humantime_serde")]
    pub send_timeout: Duration,

    /// Pause between polls when the transport reports that nothing is available.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// A session that receives nothing for this long is shut down.  `None` disables the check.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,

    /// The longest a single `tools/call` may run before it is cancelled and answered with a
    /// timeout error.
    #[serde(with = "humantime_serde")]
    pub tool_timeout: Duration,

    /// More error responses than this within one second ends the session.
    pub max_errors_per_second: u32,

    /// More error responses than this over the life of the session ends it.
    pub max_total_errors: u32,

    /// Value of `capabilities.tools.listChanged` in the `initialize` result.
    pub tools_list_changed: bool,

    /// When set, `tools/list` returns at most this many tools per call along with a `nextCursor`.
    /// `None` returns every tool at once.
    pub tools_page_size: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            framing: Framing::NewlineDelimited,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            receive_timeout: Duration::from_secs(1),
            send_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            idle_timeout: Some(Duration::from_secs(300)),
            tool_timeout: Duration::from_secs(30),
            max_errors_per_second: 10,
            max_total_errors: 50,
            tools_list_changed: false,
            tools_page_size: None,
        }
    }
}
