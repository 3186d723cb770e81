//! Local control socket.
//!
//! A Unix domain socket server ([`server`]) that answers one JSON command
//! per connection, routed through an immutable [`CommandTable`].

pub mod commands;
pub mod dispatch;
pub mod server;

pub use dispatch::{CommandHandler, CommandKind, CommandTable};
pub use server::{spawn_ipc_server, IpcResponse};
