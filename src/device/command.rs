//! Microcontroller command framing
//!
//! Commands are ASCII, angle-bracket delimited and space separated:
//!
//! ```text
//! <VERB PARAM PARAM ...>
//! <M 255 255>      drive motors
//! <L1 255>         light 1 on
//! ```
//!
//! Viewers send commands either already framed or as a JSON object of
//! command groups, `{"M": ["255", "255"], "L1": ["255"]}`, which expands to
//! one framed command per key in document order.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::{AppError, Result};

/// A single framed command for the microcontroller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCommand {
    verb: String,
    params: Vec<String>,
}

impl DeviceCommand {
    pub fn new(verb: impl Into<String>, params: Vec<String>) -> Result<Self> {
        let verb = verb.into();
        validate_token(&verb, "verb")?;
        for param in &params {
            validate_token(param, "parameter")?;
        }
        Ok(Self { verb, params })
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Wire form, e.g. `<M 255 255>`
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(
            2 + self.verb.len() + self.params.iter().map(|p| p.len() + 1).sum::<usize>(),
        );
        out.push('<');
        out.push_str(&self.verb);
        for param in &self.params {
            out.push(' ');
            out.push_str(param);
        }
        out.push('>');
        out
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for DeviceCommand {
    type Err = AppError;

    /// Parse one framed command, `<VERB PARAM ...>`
    fn from_str(s: &str) -> Result<Self> {
        let inner = s
            .trim()
            .strip_prefix('<')
            .and_then(|rest| rest.strip_suffix('>'))
            .ok_or_else(|| {
                AppError::MalformedMessage(format!("Command is not framed with <...>: {}", s))
            })?;

        let mut tokens = inner.split_whitespace();
        let verb = tokens
            .next()
            .ok_or_else(|| AppError::MalformedMessage("Empty command".to_string()))?;
        Self::new(verb, tokens.map(str::to_string).collect())
    }
}

fn validate_token(token: &str, what: &str) -> Result<()> {
    if token.is_empty() {
        return Err(AppError::MalformedMessage(format!("Empty command {}", what)));
    }
    if token
        .chars()
        .any(|c| c.is_whitespace() || c == '<' || c == '>' || !c.is_ascii())
    {
        return Err(AppError::MalformedMessage(format!(
            "Invalid command {}: {:?}",
            what, token
        )));
    }
    Ok(())
}

/// Expand a JSON object of command groups into framed commands
pub fn parse_command_groups(value: &Value) -> Result<Vec<DeviceCommand>> {
    let groups = value.as_object().ok_or_else(|| {
        AppError::MalformedMessage("Command groups must be a JSON object".to_string())
    })?;

    groups
        .iter()
        .map(|(verb, params)| {
            let params = match params {
                Value::Array(items) => items.iter().map(param_to_string).collect::<Result<_>>()?,
                Value::Null => vec![],
                scalar => vec![param_to_string(scalar)?],
            };
            DeviceCommand::new(verb.clone(), params)
        })
        .collect()
}

fn param_to_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(AppError::MalformedMessage(format!(
            "Command parameter must be a string or number, got {}",
            other
        ))),
    }
}

/// Parse free-form control text: one or more framed commands, or a JSON
/// object of command groups
pub fn parse_control_text(text: &str) -> Result<Vec<DeviceCommand>> {
    let text = text.trim();
    if text.starts_with('<') {
        let mut commands = Vec::new();
        let mut rest = text;
        while let Some(start) = rest.find('<') {
            let end = rest[start..].find('>').ok_or_else(|| {
                AppError::MalformedMessage(format!("Unterminated command in {:?}", text))
            })?;
            commands.push(rest[start..start + end + 1].parse()?);
            rest = &rest[start + end + 1..];
        }
        return Ok(commands);
    }

    let value: Value = serde_json::from_str(text)
        .map_err(|e| AppError::MalformedMessage(format!("Invalid control message: {}", e)))?;
    parse_control_value(&value)
}

/// Parse a control payload received as a JSON value (string or object)
pub fn parse_control_value(value: &Value) -> Result<Vec<DeviceCommand>> {
    match value {
        Value::String(text) => parse_control_text(text),
        Value::Object(_) => parse_command_groups(value),
        other => Err(AppError::MalformedMessage(format!(
            "Unsupported control payload: {}",
            other
        ))),
    }
}
