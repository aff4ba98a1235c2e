use crate::broker::{AttributeSync, Connectivity, MqttLink};
use crate::config::Config;
use crate::device::DeviceBoard;
use crate::report::{EventQueue, Identity, Reporter, SessionTracker};
use crate::telemetry::{self, LogHandle};
use crate::time::Clock;
use anyhow::{Context, Result};
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// What a console line did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleAction {
    LogLevel { level: String, applied: bool },
    User(String),
    Ignored,
}

/// Apply one operator console line: `LOG <level>` changes the log filter,
/// anything else is an identity command.
pub fn apply_console_line(
    line: &str,
    identity: &Identity,
    log_handle: Option<&LogHandle>,
) -> ConsoleAction {
    let trimmed = line.trim();
    let is_log = trimmed.len() > 4
        && trimmed.is_char_boundary(4)
        && trimmed[..4].eq_ignore_ascii_case("log ");
    if is_log {
        let level = trimmed[4..].trim().to_string();
        let applied = log_handle.is_some_and(|handle| telemetry::set_log_level(handle, &level));
        if applied {
            tracing::info!(%level, "log level changed");
        } else {
            tracing::warn!(%level, "log level not applied");
        }
        return ConsoleAction::LogLevel { level, applied };
    }
    match identity.apply_command(line) {
        Some(name) => ConsoleAction::User(name),
        None => ConsoleAction::Ignored,
    }
}

/// Device runtime: wires the reporter, the broker connectivity loop, the
/// device board and the operator console, and owns shutdown.
pub struct Runtime<C: Clock> {
    config: Config,
    clock: C,
    identity: Identity,
    board: Arc<DeviceBoard>,
    tracker: SessionTracker<C>,
    queue: Option<EventQueue>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    log_handle: Option<LogHandle>,
}

impl<C: Clock> Runtime<C> {
    /// Validate the config and start every background task. A reporter that
    /// fails to initialize disables local reporting only.
    pub async fn start(config: Config, clock: C, log_handle: Option<LogHandle>) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let attributes = AttributeSync::new(config.broker.attribute_retry());
        let identity = Identity::new(attributes.subscribe());
        let board = Arc::new(DeviceBoard::new(identity.clone()));
        let mut tasks = Vec::new();

        let reporter = if config.collector.enabled {
            match Reporter::start(&config.collector, shutdown_rx.clone()).await {
                Ok(reporter) => Some(reporter),
                Err(err) => {
                    tracing::error!("local reporting disabled: {err}");
                    None
                }
            }
        } else {
            tracing::info!("local reporting disabled by config");
            None
        };
        let (tracker, queue) = match reporter {
            Some(reporter) => {
                tasks.push(reporter.task);
                let tracker = SessionTracker::new(
                    reporter.queue.clone(),
                    identity.clone(),
                    board.clone(),
                    clock.clone(),
                );
                (tracker, Some(reporter.queue))
            }
            None => (
                SessionTracker::disabled(identity.clone(), board.clone(), clock.clone()),
                None,
            ),
        };

        if config.broker.enabled {
            let connectivity =
                Connectivity::new(MqttLink::new(), &config, attributes, board.clone());
            let period = Duration::from_millis(config.device.tick_ms);
            tasks.push(tokio::spawn(connectivity.run(
                clock.clone(),
                period,
                shutdown_rx.clone(),
            )));
            tracing::info!(host = %config.broker.host, port = config.broker.port, "broker connectivity started");
        } else {
            tracing::info!("broker connectivity disabled by config");
        }

        Ok(Self {
            config,
            clock,
            identity,
            board,
            tracker,
            queue,
            tasks,
            shutdown_tx,
            shutdown_rx,
            log_handle,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> C {
        self.clock.clone()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn board(&self) -> Arc<DeviceBoard> {
        self.board.clone()
    }

    pub fn tracker(&self) -> SessionTracker<C> {
        self.tracker.clone()
    }

    /// Local event queue, when reporting is active.
    pub fn queue(&self) -> Option<&EventQueue> {
        self.queue.as_ref()
    }

    pub fn log_handle(&self) -> Option<LogHandle> {
        self.log_handle.clone()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Read operator commands from stdin, one per line, until shutdown.
    pub fn attach_console(&mut self) {
        let (tx, mut rx) = mpsc::channel::<String>(8);
        // Blocking stdin reads live on a plain thread so they never hold up runtime shutdown.
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        });
        let identity = self.identity.clone();
        let log_handle = self.log_handle.clone();
        let mut shutdown = self.shutdown_rx.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    line = rx.recv() => {
                        let Some(line) = line else { break };
                        apply_console_line(&line, &identity, log_handle.as_ref());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Block until ctrl-c (or an internal shutdown request), then stop all tasks.
    pub async fn run_until_signal(&mut self) -> Result<()> {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received");
            }
            _ = self.shutdown_rx.changed() => {
                tracing::info!("shutdown requested by component");
            }
        }
        self.shutdown().await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.shutdown_tx
            .send(true)
            .context("failed to broadcast shutdown")?;
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                tracing::warn!("background task ended abnormally: {err:?}");
            }
        }
        tracing::info!("runtime stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_routes_log_and_user_commands() {
        let identity = Identity::detached();
        assert_eq!(
            apply_console_line("LOG debug", &identity, None),
            ConsoleAction::LogLevel {
                level: "debug".into(),
                applied: false
            }
        );
        assert_eq!(
            apply_console_line("USER Davi", &identity, None),
            ConsoleAction::User("Davi".into())
        );
        assert_eq!(
            apply_console_line("Logan", &identity, None),
            ConsoleAction::User("Logan".into())
        );
        assert_eq!(apply_console_line("   ", &identity, None), ConsoleAction::Ignored);
        assert_eq!(identity.active_user(), "Logan");
    }
}
