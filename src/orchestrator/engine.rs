//! Recording orchestration engine
//!
//! Consumes playback lifecycle events strictly in order and drives the
//! remote recording controller in lock-step with the loaded queue.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, trace};

use crate::obs::{RecordingAction, RecordingController};
use crate::playback::{PlaybackEngine, PlaybackEvent};
use crate::queue::MaterializedQueue;

/// Delay between a naturally concluded game and the suspend command, so the
/// encoder keeps the final frames.
const SETTLE_DELAY: Duration = Duration::from_millis(1000);

/// Recording policy for one loaded queue. Fixed until the next load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestrationMode {
    /// Whether recording transitions are issued at all
    pub recording_enabled: bool,

    /// Pause/unpause at entry boundaries instead of stop/start
    pub pause_between_entries: bool,
}

impl Default for OrchestrationMode {
    fn default() -> Self {
        Self {
            recording_enabled: false,
            pause_between_entries: true,
        }
    }
}

impl OrchestrationMode {
    /// Action issued at an entry start while the device is already recording
    fn resume_action(self) -> RecordingAction {
        if self.pause_between_entries {
            RecordingAction::Unpause
        } else {
            RecordingAction::Start
        }
    }

    /// Action issued when an entry finishes
    fn suspend_action(self) -> RecordingAction {
        if self.pause_between_entries {
            RecordingAction::Pause
        } else {
            RecordingAction::Stop
        }
    }
}

enum Flow {
    Continue,
    Done,
}

/// Drives the recording controller from the playback engine's event stream.
///
/// Events are handled one at a time, in arrival order; the handler for an
/// event fully settles, including the settle delay and the command
/// round-trip, before the next event is dequeued. The recording device is a
/// single stateful resource and interleaved transitions would corrupt the
/// recording, so ordering is enforced here rather than with locks.
pub struct Orchestrator {
    recorder: Arc<dyn RecordingController>,
    engine: Arc<dyn PlaybackEngine>,
    mode: OrchestrationMode,
    basename_tx: watch::Sender<Option<String>>,
}

impl Orchestrator {
    pub fn new(recorder: Arc<dyn RecordingController>, engine: Arc<dyn PlaybackEngine>) -> Self {
        let (basename_tx, _) = watch::channel(None);
        Self {
            recorder,
            engine,
            mode: OrchestrationMode::default(),
            basename_tx,
        }
    }

    /// Observable name of the file currently loaded for playback.
    /// Display-only; orchestration decisions never read it.
    pub fn current_basename(&self) -> watch::Receiver<Option<String>> {
        self.basename_tx.subscribe()
    }

    /// Store the mode for this queue load and hand the queue document to the
    /// playback engine.
    pub async fn load_queue(
        &mut self,
        queue: &MaterializedQueue,
        mode: OrchestrationMode,
    ) -> Result<()> {
        self.mode = mode;
        info!(
            "loading queue of {} entries (recording {}, {} between entries)",
            queue.descriptor.queue.len(),
            if mode.recording_enabled { "enabled" } else { "disabled" },
            if mode.pause_between_entries { "pausing" } else { "stopping" },
        );
        self.engine.load_queue(&queue.path).await?;
        Ok(())
    }

    /// Run the serialized event loop until the queue is exhausted or the
    /// engine process goes away.
    pub async fn run(self) -> Result<()> {
        let mut events = self.engine.subscribe();
        let mut exited = self.engine.exit_signal();

        loop {
            tokio::select! {
                // Lifecycle events take priority over the exit signal so a
                // terminal QueueEmpty is not skipped when both are pending.
                biased;

                event = events.recv() => match event {
                    Some(event) => {
                        if let Flow::Done = self.handle_event(event).await {
                            break;
                        }
                    }
                    None => {
                        debug!("playback event stream closed");
                        break;
                    }
                },
                changed = exited.changed() => {
                    if changed.is_err() || *exited.borrow() {
                        self.handle_engine_exit().await;
                        break;
                    }
                }
            }
        }

        info!("orchestration finished");
        Ok(())
    }

    /// Policy gate: transitions are only issued while recording is enabled
    /// and the device is reachable.
    fn armed(&self) -> bool {
        self.mode.recording_enabled && self.recorder.is_connected()
    }

    async fn handle_event(&self, event: PlaybackEvent) -> Flow {
        match event {
            PlaybackEvent::FileLoaded(path) => {
                // Display state only; updated even while disarmed.
                let basename = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned());
                self.basename_tx.send_replace(basename);
                Flow::Continue
            }
            PlaybackEvent::QueueEmpty => {
                info!("queue exhausted");
                if self.armed() {
                    self.dispatch(RecordingAction::Stop).await;
                }
                // Teardown is not gated; a recording-disabled run must not
                // leak the engine process.
                self.engine.kill().await;
                Flow::Done
            }
            _ if !self.armed() => {
                trace!("dropping {:?} while disarmed", event);
                Flow::Continue
            }
            PlaybackEvent::Start => {
                // The first entry of a session always hard-starts; afterwards
                // the device reports recording and the mode picks the resume
                // action.
                let action = if self.recorder.is_recording() {
                    self.mode.resume_action()
                } else {
                    RecordingAction::Start
                };
                self.dispatch(action).await;
                Flow::Continue
            }
            PlaybackEvent::End { game_ended } => {
                if game_ended {
                    tokio::time::sleep(SETTLE_DELAY).await;
                }
                self.dispatch(self.mode.suspend_action()).await;
                Flow::Continue
            }
            PlaybackEvent::CurrentFrame(_) => Flow::Continue,
        }
    }

    /// Terminal teardown: the engine process exited underneath us
    async fn handle_engine_exit(&self) {
        info!("playback engine exited");
        if self.armed() && self.recorder.is_recording() {
            self.dispatch(RecordingAction::Stop).await;
        }
    }

    /// Issue one transition. Failures are logged and swallowed so the event
    /// subscription survives a flaky device.
    async fn dispatch(&self, action: RecordingAction) {
        debug!("dispatching {:?}", action);
        if let Err(e) = self.recorder.set_recording_state(action).await {
            error!("recording command {:?} failed: {:#}", action, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::EngineError;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    /// Recorder double tracking command order, timing and overlap
    struct FakeRecorder {
        connected: bool,
        latency: Duration,
        recording: AtomicBool,
        in_flight: AtomicBool,
        overlapped: AtomicBool,
        commands: Mutex<Vec<(RecordingAction, Instant)>>,
    }

    impl FakeRecorder {
        fn new(connected: bool) -> Self {
            Self {
                connected,
                latency: Duration::from_millis(50),
                recording: AtomicBool::new(false),
                in_flight: AtomicBool::new(false),
                overlapped: AtomicBool::new(false),
                commands: Mutex::new(Vec::new()),
            }
        }

        fn actions(&self) -> Vec<RecordingAction> {
            self.commands.lock().unwrap().iter().map(|(a, _)| *a).collect()
        }
    }

    #[async_trait]
    impl RecordingController for FakeRecorder {
        fn is_connected(&self) -> bool {
            self.connected
        }

        fn is_recording(&self) -> bool {
            self.recording.load(Ordering::SeqCst)
        }

        async fn set_recording_state(&self, action: RecordingAction) -> Result<()> {
            if self.in_flight.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(self.latency).await;
            match action {
                RecordingAction::Start | RecordingAction::Unpause => {
                    self.recording.store(true, Ordering::SeqCst);
                }
                RecordingAction::Stop => self.recording.store(false, Ordering::SeqCst),
                // A paused output is still live.
                RecordingAction::Pause => {}
            }
            self.commands.lock().unwrap().push((action, Instant::now()));
            self.in_flight.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Engine double fed from the test body
    struct FakeEngine {
        events_rx: Mutex<Option<mpsc::UnboundedReceiver<PlaybackEvent>>>,
        exit_tx: watch::Sender<bool>,
        exit_rx: watch::Receiver<bool>,
        killed: AtomicBool,
    }

    impl FakeEngine {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<PlaybackEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let (exit_tx, exit_rx) = watch::channel(false);
            let engine = Arc::new(Self {
                events_rx: Mutex::new(Some(rx)),
                exit_tx,
                exit_rx,
                killed: AtomicBool::new(false),
            });
            (engine, tx)
        }
    }

    #[async_trait]
    impl PlaybackEngine for FakeEngine {
        async fn load_queue(&self, _descriptor: &Path) -> Result<(), EngineError> {
            Ok(())
        }

        async fn kill(&self) {
            self.killed.store(true, Ordering::SeqCst);
        }

        fn subscribe(&self) -> mpsc::UnboundedReceiver<PlaybackEvent> {
            self.events_rx.lock().unwrap().take().expect("single subscriber")
        }

        fn exit_signal(&self) -> watch::Receiver<bool> {
            self.exit_rx.clone()
        }
    }

    fn orchestrator(
        recorder: Arc<FakeRecorder>,
        engine: Arc<FakeEngine>,
        mode: OrchestrationMode,
    ) -> Orchestrator {
        let mut orch = Orchestrator::new(recorder, engine);
        orch.mode = mode;
        orch
    }

    fn armed_mode(pause_between_entries: bool) -> OrchestrationMode {
        OrchestrationMode {
            recording_enabled: true,
            pause_between_entries,
        }
    }

    #[test]
    fn mode_selects_transition_pair() {
        let pausing = armed_mode(true);
        assert_eq!(pausing.resume_action(), RecordingAction::Unpause);
        assert_eq!(pausing.suspend_action(), RecordingAction::Pause);

        let stopping = armed_mode(false);
        assert_eq!(stopping.resume_action(), RecordingAction::Start);
        assert_eq!(stopping.suspend_action(), RecordingAction::Stop);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_events_keep_command_order_without_overlap() {
        let recorder = Arc::new(FakeRecorder::new(true));
        let (engine, tx) = FakeEngine::new();
        let orch = orchestrator(recorder.clone(), engine.clone(), armed_mode(true));

        for _ in 0..3 {
            tx.send(PlaybackEvent::Start).unwrap();
            tx.send(PlaybackEvent::End { game_ended: false }).unwrap();
        }
        tx.send(PlaybackEvent::QueueEmpty).unwrap();

        orch.run().await.unwrap();

        assert!(!recorder.overlapped.load(Ordering::SeqCst));
        assert_eq!(
            recorder.actions(),
            vec![
                RecordingAction::Start,
                RecordingAction::Pause,
                RecordingAction::Unpause,
                RecordingAction::Pause,
                RecordingAction::Unpause,
                RecordingAction::Pause,
                RecordingAction::Stop,
            ]
        );
        assert!(engine.killed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn start_while_recording_resumes_with_unpause() {
        let recorder = Arc::new(FakeRecorder::new(true));
        recorder.recording.store(true, Ordering::SeqCst);
        let (engine, tx) = FakeEngine::new();
        let orch = orchestrator(recorder.clone(), engine, armed_mode(true));

        tx.send(PlaybackEvent::Start).unwrap();
        drop(tx);
        orch.run().await.unwrap();

        assert_eq!(recorder.actions(), vec![RecordingAction::Unpause]);
    }

    #[tokio::test(start_paused = true)]
    async fn start_while_stopped_hard_starts_regardless_of_mode() {
        let recorder = Arc::new(FakeRecorder::new(true));
        let (engine, tx) = FakeEngine::new();
        let orch = orchestrator(recorder.clone(), engine, armed_mode(true));

        tx.send(PlaybackEvent::Start).unwrap();
        drop(tx);
        orch.run().await.unwrap();

        assert_eq!(recorder.actions(), vec![RecordingAction::Start]);
    }

    #[tokio::test(start_paused = true)]
    async fn concluded_game_waits_before_suspending() {
        let recorder = Arc::new(FakeRecorder::new(true));
        recorder.recording.store(true, Ordering::SeqCst);
        let (engine, tx) = FakeEngine::new();
        let orch = orchestrator(recorder.clone(), engine, armed_mode(false));

        let begin = Instant::now();
        tx.send(PlaybackEvent::End { game_ended: true }).unwrap();
        drop(tx);
        orch.run().await.unwrap();

        let commands = recorder.commands.lock().unwrap();
        let (action, at) = commands[0];
        assert_eq!(action, RecordingAction::Stop);
        assert!(at.duration_since(begin) >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_game_suspends_immediately() {
        let recorder = Arc::new(FakeRecorder::new(true));
        recorder.recording.store(true, Ordering::SeqCst);
        let (engine, tx) = FakeEngine::new();
        let orch = orchestrator(recorder.clone(), engine, armed_mode(false));

        let begin = Instant::now();
        tx.send(PlaybackEvent::End { game_ended: false }).unwrap();
        drop(tx);
        orch.run().await.unwrap();

        let commands = recorder.commands.lock().unwrap();
        let (action, at) = commands[0];
        assert_eq!(action, RecordingAction::Stop);
        assert!(at.duration_since(begin) < Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn recording_disabled_issues_no_commands() {
        let recorder = Arc::new(FakeRecorder::new(true));
        let (engine, tx) = FakeEngine::new();
        let orch = orchestrator(
            recorder.clone(),
            engine.clone(),
            OrchestrationMode {
                recording_enabled: false,
                pause_between_entries: true,
            },
        );

        tx.send(PlaybackEvent::Start).unwrap();
        tx.send(PlaybackEvent::End { game_ended: true }).unwrap();
        tx.send(PlaybackEvent::Start).unwrap();
        tx.send(PlaybackEvent::QueueEmpty).unwrap();
        orch.run().await.unwrap();

        assert!(recorder.actions().is_empty());
        // Teardown still happens.
        assert!(engine.killed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_device_drops_events() {
        let recorder = Arc::new(FakeRecorder::new(false));
        let (engine, tx) = FakeEngine::new();
        let orch = orchestrator(recorder.clone(), engine, armed_mode(true));

        tx.send(PlaybackEvent::Start).unwrap();
        tx.send(PlaybackEvent::End { game_ended: false }).unwrap();
        drop(tx);
        orch.run().await.unwrap();

        assert!(recorder.actions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn queue_empty_hard_stops_even_in_pause_mode() {
        let recorder = Arc::new(FakeRecorder::new(true));
        recorder.recording.store(true, Ordering::SeqCst);
        let (engine, tx) = FakeEngine::new();
        let orch = orchestrator(recorder.clone(), engine.clone(), armed_mode(true));

        tx.send(PlaybackEvent::QueueEmpty).unwrap();
        orch.run().await.unwrap();

        assert_eq!(recorder.actions(), vec![RecordingAction::Stop]);
        assert!(engine.killed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn engine_exit_stops_active_recording() {
        let recorder = Arc::new(FakeRecorder::new(true));
        recorder.recording.store(true, Ordering::SeqCst);
        let (engine, _tx) = FakeEngine::new();
        let orch = orchestrator(recorder.clone(), engine.clone(), armed_mode(true));

        engine.exit_tx.send(true).unwrap();
        orch.run().await.unwrap();

        assert_eq!(recorder.actions(), vec![RecordingAction::Stop]);
    }

    #[tokio::test(start_paused = true)]
    async fn basename_updates_even_when_disarmed() {
        let recorder = Arc::new(FakeRecorder::new(true));
        let (engine, tx) = FakeEngine::new();
        let orch = orchestrator(
            recorder,
            engine,
            OrchestrationMode {
                recording_enabled: false,
                pause_between_entries: true,
            },
        );
        let basename = orch.current_basename();

        tx.send(PlaybackEvent::FileLoaded(PathBuf::from("games/a.slp"))).unwrap();
        tx.send(PlaybackEvent::QueueEmpty).unwrap();
        orch.run().await.unwrap();

        assert_eq!(*basename.borrow(), Some("a.slp".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn current_frame_events_are_ignored() {
        let recorder = Arc::new(FakeRecorder::new(true));
        let (engine, tx) = FakeEngine::new();
        let orch = orchestrator(recorder.clone(), engine, armed_mode(true));

        tx.send(PlaybackEvent::CurrentFrame(120)).unwrap();
        tx.send(PlaybackEvent::CurrentFrame(240)).unwrap();
        drop(tx);
        orch.run().await.unwrap();

        assert!(recorder.actions().is_empty());
    }
}
