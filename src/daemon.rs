//! Daemon lifecycle: start every background task, then wait for them.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::GlobalConfig;
use crate::heartbeat::spawn_heartbeat_task;
use crate::ipc::{spawn_ipc_server, CommandTable};
use crate::mailbox::spawn_mailbox_poller;
use crate::state::AppState;
use crate::stream::{spawn_event_logger, spawn_stream_watchdog, ChannelConsumer};
use crate::Result;

/// Running daemon: shared state plus its background tasks.
pub struct Daemon {
    state: Arc<AppState>,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Build state from `config` and start the daemon, logging every
    /// delivered stream chunk.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be built or the control socket
    /// cannot be bound.
    pub async fn launch(config: GlobalConfig) -> Result<Self> {
        let (consumer, events) = ChannelConsumer::channel();
        let state = Arc::new(AppState::build(config, Some(Arc::new(consumer)))?);
        let mut daemon = Self::start(state).await?;
        let logger = spawn_event_logger(events, daemon.state.shutdown.clone());
        daemon.tasks.push(logger);
        Ok(daemon)
    }

    /// Start the control socket, mailbox poller, stream watchdog, and
    /// heartbeat over existing `state`.
    ///
    /// Claims stranded by an earlier crash are returned to the inbox first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if claim recovery fails or `AppError::Ipc` if
    /// the control socket cannot be bound.
    pub async fn start(state: Arc<AppState>) -> Result<Self> {
        state.poller.recover_claims()?;

        let table = Arc::new(CommandTable::standard());
        let server = spawn_ipc_server(Arc::clone(&state), table).await?;

        let ct = state.shutdown.clone();
        let config = Arc::clone(&state.config);
        let poller = spawn_mailbox_poller(
            Arc::clone(&state.poller),
            Arc::clone(&state.streams),
            config.poll_interval(),
            ct.clone(),
        );
        let watchdog =
            spawn_stream_watchdog(Arc::clone(&state.streams), config.watchdog_interval(), ct.clone());
        let heartbeat = spawn_heartbeat_task(
            Arc::clone(&state.heartbeat),
            config.heartbeat.log_file.clone(),
            ct,
        );

        info!(
            root = %config.root.display(),
            socket = %config.socket_path.display(),
            "daemon started"
        );

        Ok(Self {
            state,
            tasks: vec![server, poller, watchdog, heartbeat],
        })
    }

    /// Shared state of the running daemon.
    #[must_use]
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Ask every task to stop.
    pub fn shutdown(&self) {
        self.state.shutdown.cancel();
    }

    /// Wait until every task has exited.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(err) = task.await {
                error!(%err, "daemon task failed");
            }
        }
        info!("daemon stopped");
    }
}
