//! Playback engine process handle

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::events::{PlaybackEvent, StatusParser};
use crate::config::PlaybackConfig;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("playback engine executable is not configured")]
    NotConfigured,

    #[error("playback engine is already running")]
    AlreadyRunning,

    #[error("failed to launch playback engine: {0}")]
    Launch(#[from] std::io::Error),
}

/// Handle to a playback engine: load a queue, kill the process, observe its
/// lifecycle events and its exit.
#[async_trait]
pub trait PlaybackEngine: Send + Sync {
    /// Begin consuming the queue document at `descriptor`
    async fn load_queue(&self, descriptor: &Path) -> Result<(), EngineError>;

    /// Force-terminate the engine process. No-op when nothing is running.
    async fn kill(&self);

    /// Take the lifecycle event stream. Single consumer; a second call
    /// returns an already-closed channel.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<PlaybackEvent>;

    /// Watch that flips to `true` once the engine process has exited
    fn exit_signal(&self) -> watch::Receiver<bool>;
}

/// Playback engine driven as a child process whose stdout carries the
/// status-line protocol.
pub struct ProcessEngine {
    config: PlaybackConfig,
    events_tx: mpsc::UnboundedSender<PlaybackEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PlaybackEvent>>>,
    exit_tx: watch::Sender<bool>,
    exit_rx: watch::Receiver<bool>,
    child: Arc<tokio::sync::Mutex<Option<Child>>>,
}

impl ProcessEngine {
    pub fn new(config: PlaybackConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(false);

        Self {
            config,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            exit_tx,
            exit_rx,
            child: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }
}

#[async_trait]
impl PlaybackEngine for ProcessEngine {
    async fn load_queue(&self, descriptor: &Path) -> Result<(), EngineError> {
        let executable = self
            .config
            .executable
            .as_ref()
            .ok_or(EngineError::NotConfigured)?;

        let mut slot = self.child.lock().await;
        if slot.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        info!("launching playback engine {:?} with queue {:?}", executable, descriptor);

        let mut child = Command::new(executable)
            .arg("-i")
            .arg(descriptor)
            .args(&self.config.extra_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.start_kill();
                return Err(EngineError::Launch(std::io::Error::other(
                    "engine stdout unavailable",
                )));
            }
        };

        *slot = Some(child);
        drop(slot);

        let events_tx = self.events_tx.clone();
        let exit_tx = self.exit_tx.clone();
        let child_slot = Arc::clone(&self.child);

        tokio::spawn(async move {
            let mut parser = StatusParser::new();
            let mut lines = BufReader::new(stdout).lines();

            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(event) = parser.parse_line(&line) {
                    if events_tx.send(event).is_err() {
                        break;
                    }
                }
            }

            // stdout EOF means the process is gone or going; reap it.
            if let Some(mut child) = child_slot.lock().await.take() {
                match child.wait().await {
                    Ok(status) => debug!("playback engine exited: {status}"),
                    Err(e) => warn!("failed to reap playback engine: {e}"),
                }
            }

            let _ = exit_tx.send(true);
        });

        Ok(())
    }

    async fn kill(&self) {
        if let Some(child) = self.child.lock().await.as_mut() {
            debug!("killing playback engine");
            if let Err(e) = child.start_kill() {
                warn!("failed to kill playback engine: {e}");
            }
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<PlaybackEvent> {
        let mut slot = self.events_rx.lock().unwrap();
        match slot.take() {
            Some(rx) => rx,
            None => {
                let (_tx, rx) = mpsc::unbounded_channel();
                rx
            }
        }
    }

    fn exit_signal(&self) -> watch::Receiver<bool> {
        self.exit_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_queue_requires_configured_executable() {
        let engine = ProcessEngine::new(PlaybackConfig::default());
        let result = engine.load_queue(Path::new("/tmp/queue.json")).await;
        assert!(matches!(result, Err(EngineError::NotConfigured)));
    }

    #[tokio::test]
    async fn kill_without_process_is_a_no_op() {
        let engine = ProcessEngine::new(PlaybackConfig::default());
        engine.kill().await;
        assert!(!*engine.exit_signal().borrow());
    }
}
