//! The tools the `picomcp` binary ships with: `echo`, and `gpio_control` driving a simulated bank of
//! output pins.
use std::sync::{Arc, Mutex, PoisonError};

use picomcp_jsonrpc::JsonValue;
use picomcp_server::{Result, ToolContext, ToolDescriptor, ToolError, ToolOutput, ToolRegistry};

/// Highest pin number `gpio_control` accepts.
pub const MAX_PIN: u8 = 16;

/// Register every demo tool in `tools`, with `pins` backing `gpio_control`.
pub fn register(tools: &ToolRegistry, pins: Arc<PinBank>) -> Result<()> {
    tools.register(echo())?;
    tools.register(gpio_control(pins))?;
    Ok(())
}

pub fn echo() -> ToolDescriptor {
    let schema = JsonValue::object()
        .with("type", "object")
        .with(
            "properties",
            JsonValue::object().with(
                "text",
                JsonValue::object()
                    .with("type", "string")
                    .with("description", "Text to echo back"),
            ),
        )
        .with("required", vec!["text"]);

    ToolDescriptor::new(
        "echo",
        "Echo back the input text",
        schema,
        |args: JsonValue, _context: ToolContext| async move {
            let text = args.get_or("text", &JsonValue::Null).as_string();
            tracing::debug!(%text, "echo");
            Ok(ToolOutput::text(format!("Echo: {text}")))
        },
    )
}

/// Logic level of one output pin.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum PinLevel {
    High,
    #[default]
    Low,
}

/// Output pins 0 through [`MAX_PIN`], all low at start.  Stands in for real GPIO hardware.
#[derive(Debug, Default)]
pub struct PinBank {
    levels: Mutex<[PinLevel; MAX_PIN as usize + 1]>,
}

impl PinBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drive `pin` to `level`, returning the level it had before.
    pub fn set(&self, pin: u8, level: PinLevel) -> Option<PinLevel> {
        let mut levels = self.levels.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = levels.get_mut(pin as usize)?;
        Some(std::mem::replace(slot, level))
    }

    pub fn get(&self, pin: u8) -> Option<PinLevel> {
        let levels = self.levels.lock().unwrap_or_else(PoisonError::into_inner);
        levels.get(pin as usize).copied()
    }
}

pub fn gpio_control(pins: Arc<PinBank>) -> ToolDescriptor {
    let schema = JsonValue::object()
        .with("type", "object")
        .with(
            "properties",
            JsonValue::object()
                .with(
                    "pin",
                    JsonValue::object()
                        .with("type", "integer")
                        .with("minimum", 0)
                        .with("maximum", MAX_PIN as u32)
                        .with("description", "GPIO pin number"),
                )
                .with(
                    "state",
                    JsonValue::object()
                        .with("type", "string")
                        .with("enum", vec!["high", "low"])
                        .with("description", "GPIO state"),
                ),
        )
        .with("required", vec!["pin", "state"]);

    ToolDescriptor::new(
        "gpio_control",
        "Control GPIO pins",
        schema,
        move |args: JsonValue, _context: ToolContext| {
            let pins = pins.clone();
            async move {
                // The schema has already bounded both arguments; these only fail if it is changed
                let pin = u8::try_from(args.get_or("pin", &JsonValue::Null).as_int())
                    .map_err(|_| ToolError::InvalidArguments("pin is out of range".to_string()))?;
                let state = args.get_or("state", &JsonValue::Null).as_str();
                let level = state
                    .parse::<PinLevel>()
                    .map_err(|_| ToolError::InvalidArguments(format!("Invalid state: {state}")))?;

                let previous = pins
                    .set(pin, level)
                    .ok_or_else(|| ToolError::InvalidArguments(format!("No such pin: {pin}")))?;
                tracing::info!(pin, %previous, %level, "GPIO pin set");

                Ok(ToolOutput::text(format!("GPIO pin {pin} set to {level}")))
            }
        },
    )
}
