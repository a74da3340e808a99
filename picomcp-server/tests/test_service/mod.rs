//! The tools the integration tests run against, and a server configured to exercise them.
//!
//! Shared by the compatibility and integration test programs; not every program uses every item.
#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use picomcp_jsonrpc::JsonValue;
use picomcp_server::{Server, ServerConfig, ToolContext, ToolDescriptor, ToolError, ToolOutput, ToolRegistry};
use serde_json::json;

/// Config suited to tests: loopback on an ephemeral port, fast polling, short tool timeout.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listen_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
    config.server_info.name = "picomcp-test".to_string();
    config.server_info.version = "1.0.0".to_string();
    config.session.receive_timeout = Duration::from_millis(20);
    config.session.poll_interval = Duration::from_millis(1);
    config.session.tool_timeout = Duration::from_millis(500);
    config
}

pub fn test_tools() -> ToolRegistry {
    let tools = ToolRegistry::new();
    for tool in [echo(), add(), fail(), sleep(), panic()] {
        tools.register(tool).unwrap();
    }
    tools
}

pub fn test_server(config: ServerConfig) -> Server {
    Server::new(config, test_tools()).unwrap()
}

fn echo() -> ToolDescriptor {
    ToolDescriptor::new(
        "echo",
        "Echo the text back",
        json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        }),
        |args: JsonValue, _context: ToolContext| async move {
            let text = args.get_or("text", &JsonValue::Null).as_string();
            Ok(ToolOutput::text(format!("Echo: {text}")))
        },
    )
}

fn add() -> ToolDescriptor {
    ToolDescriptor::new(
        "add",
        "Add two numbers",
        json!({
            "type": "object",
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
            "required": ["a", "b"],
            "additionalProperties": false
        }),
        |args: JsonValue, _context: ToolContext| async move {
            let sum = args.get_or("a", &JsonValue::Null).as_double() + args.get_or("b", &JsonValue::Null).as_double();
            Ok(ToolOutput::text(JsonValue::number(sum).to_string()))
        },
    )
}

fn fail() -> ToolDescriptor {
    ToolDescriptor::new(
        "fail",
        "Fails, either hard or softly",
        json!({
            "type": "object",
            "properties": {"soft": {"type": "boolean"}}
        }),
        |args: JsonValue, _context: ToolContext| async move {
            if args.get_or("soft", &JsonValue::Null).as_bool() {
                Ok(ToolOutput::error_text("soft failure"))
            } else {
                Err(ToolError::failed("hard failure"))
            }
        },
    )
}

/// Sleeps in small steps, stopping at the first step after cancellation.
fn sleep() -> ToolDescriptor {
    ToolDescriptor::new(
        "sleep",
        "Sleep for a while",
        json!({
            "type": "object",
            "properties": {"ms": {"type": "integer", "minimum": 0}},
            "required": ["ms"]
        }),
        |args: JsonValue, context: ToolContext| async move {
            let ms = args.get_or("ms", &JsonValue::Null).as_int().max(0) as u64;
            let deadline = tokio::time::Instant::now() + Duration::from_millis(ms);
            while tokio::time::Instant::now() < deadline {
                context.checkpoint()?;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok::<_, ToolError>(ToolOutput::text(format!("Slept {ms}ms")))
        },
    )
}

fn panic() -> ToolDescriptor {
    ToolDescriptor::new(
        "panic",
        "Panics",
        json!({"type": "object"}),
        |_args: JsonValue, _context: ToolContext| async move {
            let nothing: Option<ToolOutput> = None;
            Ok(nothing.expect("this tool always panics"))
        },
    )
}
