//! Command name → handler table.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tracing::{debug, info_span, Instrument};

use crate::models::request::Request;
use crate::state::AppState;
use crate::{AppError, Result};

/// Future returned by [`CommandHandler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>>;

/// How a command interacts with the rest of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Answers from local state.
    Query,
    /// Writes an outbound message and acknowledges it.
    Relay,
    /// Opens a stream session and writes its request.
    Stream,
    /// Changes daemon state.
    Control,
}

/// A named control command.
pub trait CommandHandler: Send + Sync {
    /// Value of the request's `command` field this handler answers.
    fn name(&self) -> &'static str;

    /// Category of the command.
    fn kind(&self) -> CommandKind;

    /// Execute the command and produce the `data` payload.
    ///
    /// # Errors
    ///
    /// Any error is turned into an `{"ok": false}` response by the server.
    fn handle<'a>(&'a self, request: &'a Request, state: &'a AppState) -> HandlerFuture<'a>;
}

/// Immutable registry of command handlers.
pub struct CommandTable {
    handlers: BTreeMap<&'static str, Box<dyn CommandHandler>>,
}

impl CommandTable {
    /// Start an empty table.
    #[must_use]
    pub fn builder() -> CommandTableBuilder {
        CommandTableBuilder {
            handlers: BTreeMap::new(),
        }
    }

    /// Table holding every built-in command.
    #[must_use]
    pub fn standard() -> Self {
        super::commands::register_all(Self::builder()).build()
    }

    /// Registered command names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }

    /// Category of `name`, if registered.
    #[must_use]
    pub fn kind_of(&self, name: &str) -> Option<CommandKind> {
        self.handlers.get(name).map(|handler| handler.kind())
    }

    /// Route `request` to its handler.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UnknownCommand` if no handler is registered for
    /// the command, otherwise whatever the handler returns.
    pub async fn dispatch(&self, request: &Request, state: &AppState) -> Result<Value> {
        let Some(handler) = self.handlers.get(request.command.as_str()) else {
            return Err(AppError::UnknownCommand(request.command.clone()));
        };
        let span = info_span!("command", command = handler.name(), kind = ?handler.kind());
        async move {
            debug!("dispatching command");
            handler.handle(request, state).await
        }
        .instrument(span)
        .await
    }
}

/// Collects handlers before the table is frozen.
pub struct CommandTableBuilder {
    handlers: BTreeMap<&'static str, Box<dyn CommandHandler>>,
}

impl CommandTableBuilder {
    /// Add `handler`, replacing any earlier handler with the same name.
    #[must_use]
    pub fn register(mut self, handler: impl CommandHandler + 'static) -> Self {
        self.handlers.insert(handler.name(), Box::new(handler));
        self
    }

    /// Freeze the table.
    #[must_use]
    pub fn build(self) -> CommandTable {
        CommandTable {
            handlers: self.handlers,
        }
    }
}
