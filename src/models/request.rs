//! Control socket request model.

use serde_json::{Map, Value};

use crate::{AppError, Result};

/// One control request, parsed from a single connection.
///
/// `command` is lifted out of the JSON object; every other top-level
/// field is kept in `args`.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Command verb.
    pub command: String,
    /// Remaining request fields.
    pub args: Map<String, Value>,
    /// Raw request text as received.
    pub raw: String,
}

impl Request {
    /// Parse raw request bytes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the payload is not UTF-8, not a JSON
    /// object, or lacks a non-empty string `command` field.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|err| AppError::Protocol(format!("request is not utf-8: {err}")))?;
        let trimmed = text.trim();

        let value: Value = serde_json::from_str(trimmed)
            .map_err(|err| AppError::Protocol(format!("invalid json: {err}")))?;

        let Value::Object(mut args) = value else {
            return Err(AppError::Protocol("request is not a json object".into()));
        };

        let command = match args.remove("command") {
            Some(Value::String(command)) if !command.trim().is_empty() => command,
            Some(_) => {
                return Err(AppError::Protocol("'command' must be a non-empty string".into()))
            }
            None => return Err(AppError::Protocol("missing 'command' field".into())),
        };

        Ok(Self {
            command,
            args,
            raw: trimmed.to_owned(),
        })
    }

    /// Optional string argument.
    #[must_use]
    pub fn str_arg(&self, name: &str) -> Option<&str> {
        self.args.get(name).and_then(Value::as_str)
    }

    /// Required non-empty string argument.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BadRequest` if the field is missing, empty, or not
    /// a string.
    pub fn required_str(&self, name: &str) -> Result<&str> {
        match self.str_arg(name) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(AppError::BadRequest(format!(
                "missing required '{name}' field"
            ))),
        }
    }

    /// Optional unsigned integer argument.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BadRequest` if the field is present but not an
    /// unsigned integer.
    pub fn u64_arg(&self, name: &str) -> Result<Option<u64>> {
        match self.args.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value.as_u64().map(Some).ok_or_else(|| {
                AppError::BadRequest(format!("'{name}' must be an unsigned integer"))
            }),
        }
    }
}
