//! OBS WebSocket recording controller implementation

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use obws::events::{Event, OutputState};
use obws::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::config::ObsConfig;

/// Recording-state transition commands accepted by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingAction {
    Start,
    Stop,
    Pause,
    Unpause,
}

/// Device recording output state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingState {
    #[default]
    Stopped,
    Starting,
    Recording,
    Stopping,
    Paused,
}

impl RecordingState {
    /// Whether the output is live. A paused output is still live; pausing
    /// suspends the encode without ending the file.
    pub fn is_active(self) -> bool {
        matches!(self, RecordingState::Recording | RecordingState::Paused)
    }
}

/// Remote recording device contract.
///
/// State queries never suspend; they read a mirror kept fresh by the
/// device's own event feed. The command call suspends and may fail.
#[async_trait]
pub trait RecordingController: Send + Sync {
    fn is_connected(&self) -> bool;
    fn is_recording(&self) -> bool;
    async fn set_recording_state(&self, action: RecordingAction) -> Result<()>;
}

/// Cached mirror of the device state
#[derive(Debug, Default)]
struct DeviceState {
    connected: AtomicBool,
    recording: Mutex<RecordingState>,
}

impl DeviceState {
    fn set_recording(&self, state: RecordingState) {
        *self.recording.lock().unwrap() = state;
    }

    fn recording(&self) -> RecordingState {
        *self.recording.lock().unwrap()
    }
}

/// A transition the device treats as a no-op given its current state
fn transition_is_redundant(state: RecordingState, action: RecordingAction) -> bool {
    matches!(
        (state, action),
        (RecordingState::Recording, RecordingAction::Start)
            | (RecordingState::Recording, RecordingAction::Unpause)
            | (RecordingState::Paused, RecordingAction::Pause)
            | (RecordingState::Stopped, RecordingAction::Stop)
    )
}

fn map_output_state(active: bool, state: OutputState) -> RecordingState {
    match state {
        OutputState::Starting => RecordingState::Starting,
        OutputState::Started => RecordingState::Recording,
        OutputState::Paused => RecordingState::Paused,
        OutputState::Resumed => RecordingState::Recording,
        OutputState::Stopping => RecordingState::Stopping,
        OutputState::Stopped => RecordingState::Stopped,
        _ => {
            if active {
                RecordingState::Recording
            } else {
                RecordingState::Stopped
            }
        }
    }
}

/// Controller for OBS recording over WebSocket
pub struct ObsController {
    client: Option<Client>,
    state: Arc<DeviceState>,
}

impl ObsController {
    /// Connect to the OBS WebSocket server and start mirroring its state
    pub async fn connect(config: &ObsConfig) -> Result<Self> {
        let client = Client::connect(&config.host, config.port, config.password.as_deref())
            .await
            .context("Failed to connect to OBS WebSocket")?;

        let state = Arc::new(DeviceState::default());
        state.connected.store(true, Ordering::SeqCst);

        let controller = Self {
            client: Some(client),
            state,
        };

        controller.refresh_state().await?;
        controller.spawn_state_watcher()?;

        Ok(controller)
    }

    /// A controller that never connected; every state query reports false
    /// and commands fail. Used when recording is disabled for the session.
    pub fn offline() -> Self {
        Self {
            client: None,
            state: Arc::new(DeviceState::default()),
        }
    }

    /// Query the device and overwrite the cached mirror
    async fn refresh_state(&self) -> Result<()> {
        let client = self.client.as_ref().context("not connected to OBS")?;
        let status = client.recording().status().await?;

        let state = if status.paused {
            RecordingState::Paused
        } else if status.active {
            RecordingState::Recording
        } else {
            RecordingState::Stopped
        };
        self.state.set_recording(state);

        debug!("OBS state: recording={:?}", state);
        Ok(())
    }

    /// Mirror RecordStateChanged events into the cached state. The stream
    /// ending means the connection is gone.
    fn spawn_state_watcher(&self) -> Result<()> {
        let client = self.client.as_ref().context("not connected to OBS")?;
        let events = client
            .events()
            .context("Failed to subscribe to OBS events")?;
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            tokio::pin!(events);

            while let Some(event) = events.next().await {
                if let Event::RecordStateChanged {
                    active,
                    state: output_state,
                    ..
                } = event
                {
                    let mapped = map_output_state(active, output_state);
                    debug!("OBS record state changed: {:?}", mapped);
                    state.set_recording(mapped);
                }
            }

            state.connected.store(false, Ordering::SeqCst);
            warn!("OBS event stream closed, marking device disconnected");
        });

        Ok(())
    }
}

#[async_trait]
impl RecordingController for ObsController {
    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    fn is_recording(&self) -> bool {
        self.state.recording().is_active()
    }

    async fn set_recording_state(&self, action: RecordingAction) -> Result<()> {
        let client = self.client.as_ref().context("not connected to OBS")?;

        let current = self.state.recording();
        if transition_is_redundant(current, action) {
            debug!("skipping {:?}, device already {:?}", action, current);
            return Ok(());
        }

        match action {
            RecordingAction::Start => {
                client.recording().start().await?;
                self.state.set_recording(RecordingState::Recording);
            }
            RecordingAction::Stop => {
                client.recording().stop().await?;
                self.state.set_recording(RecordingState::Stopped);
            }
            RecordingAction::Pause => {
                client.recording().pause().await?;
                self.state.set_recording(RecordingState::Paused);
            }
            RecordingAction::Unpause => {
                client.recording().resume().await?;
                self.state.set_recording(RecordingState::Recording);
            }
        }

        info!("recording state set: {:?}", action);
        Ok(())
    }
}
