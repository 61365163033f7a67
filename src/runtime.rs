//! The embeddable mesh runtime.
//!
//! A [`Mesh`] owns the dispatcher task and its tickers. `start()` spawns
//! them onto the ambient tokio runtime; `connect()` accepts a worker and
//! wires its frame stream into the dispatcher's command channel. All
//! cross-connection state lives inside the dispatcher task, so the runtime
//! handle itself is thin: a config and a command-channel sender.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::MeshConfig;
use crate::dispatcher::{Command, Dispatcher, MeshStats};
use crate::errors::MeshError;
use crate::worker::Worker;

struct Running {
    commands: mpsc::Sender<Command>,
    dispatcher: JoinHandle<()>,
    tickers: Vec<JoinHandle<()>>,
}

/// A message-routing runtime for worker processes hosting agents.
pub struct Mesh {
    config: MeshConfig,
    inner: Mutex<Option<Running>>,
}

impl Default for Mesh {
    fn default() -> Self {
        Self::new()
    }
}

impl Mesh {
    pub fn new() -> Self {
        Self::with_config(MeshConfig::default())
    }

    pub fn with_config(config: MeshConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Spawn the dispatcher and its expiry/liveness tickers. Must be
    /// called from within a tokio runtime.
    pub fn start(&self) -> Result<(), MeshError> {
        let mut inner = self.inner.lock();
        if inner.is_some() {
            return Err(MeshError::AlreadyRunning);
        }

        let (commands, rx) = mpsc::channel(self.config.channel_capacity);
        let dispatcher = tokio::spawn(Dispatcher::new(self.config.clone()).run(rx));
        let tickers = vec![
            spawn_ticker(commands.clone(), self.config.sweep_interval, || {
                Command::SweepExpired
            }),
            spawn_ticker(commands.clone(), self.config.heartbeat_interval, || {
                Command::CheckLiveness
            }),
        ];

        *inner = Some(Running {
            commands,
            dispatcher,
            tickers,
        });
        tracing::debug!("mesh runtime started");
        Ok(())
    }

    /// Stop the dispatcher. Connected workers observe closed channels and
    /// resolve their in-flight calls as lost.
    pub async fn stop(&self) -> Result<(), MeshError> {
        let running = self.inner.lock().take().ok_or(MeshError::NotRunning)?;
        let _ = running.commands.send(Command::Shutdown).await;
        for ticker in running.tickers {
            ticker.abort();
        }
        let _ = running.dispatcher.await;
        tracing::debug!("mesh runtime stopped");
        Ok(())
    }

    /// Accept a new worker connection and return its client half.
    ///
    /// The worker is not routable until it calls
    /// [`activate()`](Worker::activate).
    pub async fn connect(&self) -> Result<Worker, MeshError> {
        let commands = self.commands()?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(Command::Connect {
                outbound: outbound_tx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| MeshError::NotRunning)?;
        let conn = reply_rx.await.map_err(|_| MeshError::NotRunning)?;

        // Bridge the worker's frame stream into the command channel. The
        // bounded channel applies backpressure to a worker that outruns
        // the dispatcher.
        let (frame_tx, mut frame_rx) = mpsc::channel(self.config.channel_capacity);
        let forward = commands.clone();
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if forward.send(Command::Inbound { conn, frame }).await.is_err() {
                    break;
                }
            }
            let _ = forward.send(Command::Disconnected { conn }).await;
        });

        Ok(Worker::new(conn, frame_tx, outbound_rx, self.config.clone()))
    }

    /// Point-in-time counters over the dispatcher's state.
    pub async fn stats(&self) -> Result<MeshStats, MeshError> {
        let commands = self.commands()?;
        let (tx, rx) = oneshot::channel();
        commands
            .send(Command::Stats { reply: tx })
            .await
            .map_err(|_| MeshError::NotRunning)?;
        rx.await.map_err(|_| MeshError::NotRunning)
    }

    fn commands(&self) -> Result<mpsc::Sender<Command>, MeshError> {
        self.inner
            .lock()
            .as_ref()
            .map(|r| r.commands.clone())
            .ok_or(MeshError::NotRunning)
    }
}

fn spawn_ticker(
    tx: mpsc::Sender<Command>,
    period: Duration,
    make: impl Fn() -> Command + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if tx.send(make()).await.is_err() {
                break;
            }
        }
    })
}
