use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{Instrument, Span, error, info, info_span};

use super::{
    modes::{self, CaptureLayout},
    supervisor::{FailureReport, OutputStream, ProcessRole, ProcessSupervisor, SupervisorOptions},
    traits::CaptureBackend,
};
use crate::{
    core::{
        errors::ProcessError,
        state::{ControlState, ControlStatus, Mode},
    },
    settings::{SettingsSnapshot, SettingsStore},
};

#[derive(Debug, Clone)]
pub struct ControlOptions {
    pub layout: CaptureLayout,
    pub settle_timeout: Option<Duration>,
    pub output_capacity: usize,
}

#[derive(Debug)]
struct ControlRecord {
    mode: Mode,
    state: ControlState,
    last_error: Option<String>,
    /// Bumped by `stop` and `set_mode`. A `start` that sees it move
    /// abandons its capture launch.
    epoch: u64,
}

impl ControlRecord {
    fn note_failure(&mut self, role: ProcessRole, err: &ProcessError) {
        self.last_error = Some(format!("{role}: {err}"));
    }
}

type SharedRecord = Arc<Mutex<ControlRecord>>;

/// Owns the action, stream and motion slots and sequences every start and
/// stop against the camera.
///
/// `start` and `restart_stream` are queued behind one another in arrival
/// order. `stop`, `set_mode`, `status` and `stream` never wait on that queue,
/// so a stop can always cut an in-flight start short.
pub struct CameraControl<B: CaptureBackend> {
    settings: Arc<SettingsStore>,
    layout: CaptureLayout,
    action: ProcessSupervisor<B>,
    stream: ProcessSupervisor<B>,
    motion: ProcessSupervisor<B>,
    record: SharedRecord,
    sequence: Arc<AsyncMutex<()>>,
    span: Span,
}

impl<B: CaptureBackend> CameraControl<B> {
    /// Builds the coordinator and starts the live stream right away. Must be
    /// called from within a tokio runtime.
    pub fn launch(
        backend: Arc<B>,
        settings: Arc<SettingsStore>,
        options: ControlOptions,
    ) -> Arc<Self> {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let supervisor = |role: ProcessRole| {
            ProcessSupervisor::new(
                role,
                backend.clone(),
                SupervisorOptions {
                    early_resolution: true,
                    settle_timeout: options.settle_timeout,
                    output_capacity: options.output_capacity,
                },
                failures_tx.clone(),
                info_span!("process", %role),
            )
        };

        let control = Arc::new(Self {
            settings,
            layout: options.layout.clone(),
            action: supervisor(ProcessRole::Action),
            stream: supervisor(ProcessRole::Stream),
            motion: supervisor(ProcessRole::Motion),
            record: Arc::new(Mutex::new(ControlRecord {
                mode: Mode::default(),
                state: ControlState::Idle,
                last_error: None,
                epoch: 0,
            })),
            sequence: Arc::new(AsyncMutex::new(())),
            span: info_span!("control"),
        });

        tokio::spawn(
            record_late_failures(control.record.clone(), failures_rx).instrument(control.span.clone()),
        );

        // Taken before returning so every later request queues behind the
        // initial stream start.
        if let Ok(guard) = control.sequence.clone().try_lock_owned() {
            let eager = control.clone();
            tokio::spawn(async move {
                let settings = eager.settings.snapshot();
                eager.start_stream(&settings).await;
                drop(guard);
            });
        }

        control
    }

    pub async fn start(&self) {
        let _sequence = self.sequence.lock().await;
        let (mode, epoch) = {
            let mut record = self.record();
            record.state = ControlState::Starting;
            record.last_error = None;
            (record.mode, record.epoch)
        };
        info!(parent: &self.span, "start {mode}");

        self.action.stop().await;
        self.stream.stop().await;
        self.motion.stop().await;

        let settings = self.settings.snapshot();
        match mode {
            Mode::Stream => self.start_stream(&settings).await,
            Mode::Photo | Mode::Video => {
                // A stop or mode switch that lands while this start is in flight
                // wins: the capture is skipped but the live feed comes back.
                let resume_stream = if self.cancelled(epoch) {
                    info!(parent: &self.span, "start {mode} cancelled before launch");
                    true
                } else {
                    let spec = modes::resolve(mode, &settings, &self.layout);
                    match self.action.start(spec).await {
                        Ok(()) => {
                            if self.cancelled(epoch) {
                                self.action.stop().await;
                            }
                            true
                        }
                        Err(err) => {
                            self.fail(ProcessRole::Action, err);
                            false
                        }
                    }
                };
                if resume_stream {
                    self.start_stream(&settings).await;
                }
            }
        }

        let running = self.mode_running(mode);
        let mut record = self.record();
        if record.state == ControlState::Starting {
            record.state = if running {
                ControlState::Running
            } else {
                ControlState::Idle
            };
        }
    }

    /// Stops the one-shot capture. The live stream keeps running.
    pub async fn stop(&self) {
        let mode = {
            let mut record = self.record();
            record.state = ControlState::Stopping;
            record.epoch += 1;
            record.mode
        };
        info!(parent: &self.span, "stop {mode}");

        self.action.stop().await;
        self.record().state = ControlState::Idle;
    }

    /// Switches the mode used by the next `start`.
    pub async fn set_mode(&self, mode: Mode) {
        if self.action.running() {
            self.stop().await;
        }
        info!(parent: &self.span, "mode set to {mode}");
        let mut record = self.record();
        record.mode = mode;
        record.epoch += 1;
    }

    /// Cycles the stream (and motion) so they pick up new settings. Does
    /// nothing while neither is running.
    pub async fn restart_stream(&self) {
        let _sequence = self.sequence.lock().await;
        if !self.stream.running() && !self.motion.running() {
            info!(parent: &self.span, "restart_stream skipped, stream not running");
            return;
        }

        info!(parent: &self.span, "restart_stream");
        let settings = self.settings.snapshot();
        self.start_stream(&settings).await;
    }

    pub fn status(&self) -> ControlStatus {
        let record = self.record();
        let running = self.mode_running(record.mode);
        let state = match record.state {
            ControlState::Running if !running => ControlState::Idle,
            state => state,
        };

        ControlStatus {
            mode: record.mode,
            state,
            running,
            last_error: record.last_error.clone(),
            stream_running: self.stream.running(),
            motion_running: self.motion.running(),
        }
    }

    pub fn stream(&self) -> OutputStream {
        self.stream.output()
    }

    /// Resolves once no start or restart sequence is in flight.
    pub async fn wait_idle(&self) {
        let _sequence = self.sequence.lock().await;
    }

    async fn start_stream(&self, settings: &SettingsSnapshot) {
        self.stream.stop().await;
        self.motion.stop().await;

        info!(parent: &self.span, "starting stream");
        if let Err(err) = self.stream.start(modes::resolve_stream(settings)).await {
            self.fail(ProcessRole::Stream, err);
            return;
        }

        if let Some(spec) = modes::resolve_motion(settings, &self.layout) {
            if let Err(err) = self.motion.start(spec).await {
                self.fail(ProcessRole::Motion, err);
            }
        }
    }

    fn cancelled(&self, epoch: u64) -> bool {
        self.record().epoch != epoch
    }

    fn mode_running(&self, mode: Mode) -> bool {
        match mode {
            Mode::Stream => self.stream.running(),
            Mode::Photo | Mode::Video => self.action.running(),
        }
    }

    fn fail(&self, role: ProcessRole, err: ProcessError) {
        error!(parent: &self.span, "{role} failed: {err}");
        self.record().note_failure(role, &err);
    }

    fn record(&self) -> MutexGuard<'_, ControlRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn record_late_failures(
    record: SharedRecord,
    mut failures: mpsc::UnboundedReceiver<FailureReport>,
) {
    while let Some((role, err)) = failures.recv().await {
        error!("{role} stopped after start: {err}");
        record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .note_failure(role, &err);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        path::{Path, PathBuf},
        process::Stdio,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::{
        process::{Child, Command},
        task::yield_now,
        time::{sleep, timeout},
    };

    use super::{CameraControl, ControlOptions};
    use crate::{
        camera::{
            args::ArgValue,
            modes::CaptureLayout,
            traits::{CaptureBackend, Program},
        },
        core::state::{ControlState, Mode},
        settings::{SettingsKind, SettingsStore},
    };

    const LIVE: &str = "echo frame; exec sleep 30";

    #[derive(Debug, Clone)]
    struct Launch {
        program: Program,
        pid: Option<u32>,
        /// Earlier launches whose process was still alive at this spawn.
        alive_before: Vec<u32>,
    }

    /// Maps each program to a shell script; programs without a script fail
    /// to spawn. Every launch attempt is recorded.
    struct ScriptBackend {
        scripts: HashMap<Program, &'static str>,
        launches: Mutex<Vec<Launch>>,
    }

    impl ScriptBackend {
        fn with(scripts: &[(Program, &'static str)]) -> Self {
            Self {
                scripts: scripts.iter().copied().collect(),
                launches: Mutex::new(Vec::new()),
            }
        }
    }

    fn is_alive(pid: u32) -> bool {
        Path::new(&format!("/proc/{pid}")).exists()
    }

    #[async_trait]
    impl CaptureBackend for ScriptBackend {
        fn binary(&self, program: Program) -> String {
            format!("test-{program}")
        }

        async fn spawn(&self, program: Program, _args: &[String]) -> std::io::Result<Child> {
            let mut launches = self.launches.lock().expect("launch log should lock");
            let alive_before = launches
                .iter()
                .filter_map(|launch| launch.pid)
                .filter(|pid| is_alive(*pid))
                .collect();

            let spawned = match self.scripts.get(&program) {
                Some(script) => Command::new("sh")
                    .arg("-c")
                    .arg(script)
                    .stdout(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn(),
                None => Command::new("/nonexistent/raspicam-test/capture")
                    .stdout(Stdio::piped())
                    .spawn(),
            };
            launches.push(Launch {
                program,
                pid: spawned.as_ref().ok().and_then(Child::id),
                alive_before,
            });
            spawned
        }
    }

    fn options() -> ControlOptions {
        ControlOptions {
            layout: CaptureLayout {
                captures_dir: PathBuf::from("/tmp/raspicam-test/photos"),
                motions_prefix: "motions/motion".to_string(),
            },
            settle_timeout: Some(Duration::from_secs(5)),
            output_capacity: 16,
        }
    }

    struct Harness {
        control: Arc<CameraControl<ScriptBackend>>,
        backend: Arc<ScriptBackend>,
    }

    impl Harness {
        async fn launch(scripts: &[(Program, &'static str)], settings: SettingsStore) -> Self {
            let backend = Arc::new(ScriptBackend::with(scripts));
            let control = CameraControl::launch(backend.clone(), Arc::new(settings), options());
            timeout(Duration::from_secs(10), control.wait_idle())
                .await
                .expect("eager stream start should finish");
            Self { control, backend }
        }

        fn launches(&self) -> Vec<Launch> {
            self.backend
                .launches
                .lock()
                .expect("launch log should lock")
                .clone()
        }
    }

    fn motion_enabled() -> SettingsStore {
        let settings = SettingsStore::new();
        settings.apply(
            SettingsKind::Motion,
            [("enabled".to_string(), Some(ArgValue::Bool(true)))]
                .into_iter()
                .collect(),
        );
        settings
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..50 {
            if check() {
                return true;
            }
            sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[tokio::test]
    async fn stream_starts_at_construction() {
        let harness = Harness::launch(&[(Program::Vid, LIVE)], SettingsStore::new()).await;

        let status = harness.control.status();
        assert_eq!(status.mode, Mode::Photo);
        assert!(status.stream_running);
        assert!(!status.running);
        assert!(!status.motion_running);
        assert_eq!(harness.launches().len(), 1);
    }

    #[tokio::test]
    async fn photo_then_video_stops_each_process_before_the_next_launch() {
        let harness = Harness::launch(
            &[(Program::Still, LIVE), (Program::Vid, LIVE)],
            SettingsStore::new(),
        )
        .await;
        let control = &harness.control;

        control.start().await;
        let status = control.status();
        assert_eq!(status.mode, Mode::Photo);
        assert_eq!(status.state, ControlState::Running);
        assert!(status.running);
        assert!(status.stream_running);
        assert!(status.last_error.is_none());

        control.set_mode(Mode::Video).await;
        assert!(!control.status().running, "set_mode should stop the running capture");
        control.start().await;

        let status = control.status();
        assert_eq!(status.mode, Mode::Video);
        assert!(status.running);
        assert!(status.stream_running);

        let launches = harness.launches();
        let programs: Vec<Program> = launches.iter().map(|launch| launch.program).collect();
        assert_eq!(
            programs,
            [Program::Vid, Program::Still, Program::Vid, Program::Vid, Program::Vid]
        );
        // Captures launch alone; each stream launch only overlaps its capture.
        let photo_pid = launches[1].pid.expect("photo process should have a pid");
        let video_pid = launches[3].pid.expect("video process should have a pid");
        assert!(launches[1].alive_before.is_empty());
        assert_eq!(launches[2].alive_before, [photo_pid]);
        assert!(launches[3].alive_before.is_empty());
        assert_eq!(launches[4].alive_before, [video_pid]);
        assert!(!is_alive(photo_pid));
    }

    #[tokio::test]
    async fn stop_leaves_the_stream_running() {
        let harness =
            Harness::launch(&[(Program::Still, LIVE), (Program::Vid, LIVE), (Program::Motion, LIVE)], motion_enabled())
                .await;
        let control = &harness.control;

        control.start().await;
        let before = control.status();
        assert!(before.running);
        assert!(before.stream_running);
        assert!(before.motion_running);

        control.stop().await;
        let after = control.status();
        assert!(!after.running);
        assert_eq!(after.state, ControlState::Idle);
        assert_eq!(after.stream_running, before.stream_running);
        assert_eq!(after.motion_running, before.motion_running);
    }

    #[tokio::test]
    async fn restart_without_running_stream_launches_nothing() {
        let harness = Harness::launch(&[(Program::Still, LIVE)], SettingsStore::new()).await;
        let status = harness.control.status();
        assert!(!status.stream_running);
        assert!(!status.motion_running);
        let attempts = harness.launches().len();

        timeout(Duration::from_secs(5), harness.control.restart_stream())
            .await
            .expect("restart should return immediately");
        assert_eq!(harness.launches().len(), attempts);
    }

    #[tokio::test]
    async fn restart_cycles_stream_and_motion() {
        let harness =
            Harness::launch(&[(Program::Vid, LIVE), (Program::Motion, LIVE)], motion_enabled()).await;
        let first = harness.launches();
        assert_eq!(first.len(), 2);

        harness.control.restart_stream().await;
        let launches = harness.launches();
        assert_eq!(launches.len(), 4);
        assert_eq!(launches[2].program, Program::Vid);
        assert_eq!(launches[3].program, Program::Motion);
        assert!(launches[2].alive_before.is_empty());

        let status = harness.control.status();
        assert!(status.stream_running);
        assert!(status.motion_running);
    }

    #[tokio::test]
    async fn external_exit_shows_up_in_status() {
        let harness =
            Harness::launch(&[(Program::Vid, "echo frame; sleep 0.3")], SettingsStore::new()).await;
        assert!(harness.control.status().stream_running);

        assert!(eventually(|| !harness.control.status().stream_running).await);
        assert!(harness.control.status().last_error.is_none());
    }

    #[tokio::test]
    async fn unexpected_exit_after_start_is_recorded() {
        let harness = Harness::launch(
            &[(Program::Vid, "echo frame; sleep 0.3; exit 4")],
            SettingsStore::new(),
        )
        .await;

        assert!(eventually(|| harness.control.status().last_error.is_some()).await);
        let status = harness.control.status();
        assert!(!status.stream_running);
        let last_error = status.last_error.expect("error should be recorded");
        assert!(last_error.starts_with("stream:"), "unexpected error: {last_error}");
    }

    #[tokio::test]
    async fn stream_spawn_failure_does_not_touch_the_capture() {
        let harness = Harness::launch(&[(Program::Still, LIVE)], SettingsStore::new()).await;

        harness.control.start().await;
        let status = harness.control.status();
        assert!(status.running, "capture should keep running");
        assert!(!status.stream_running);
        let last_error = status.last_error.expect("stream failure should be recorded");
        assert!(last_error.starts_with("stream:"), "unexpected error: {last_error}");
    }

    #[tokio::test]
    async fn motion_failure_keeps_the_stream() {
        let harness = Harness::launch(&[(Program::Vid, LIVE)], motion_enabled()).await;

        let status = harness.control.status();
        assert!(status.stream_running);
        assert!(!status.motion_running);
        let last_error = status.last_error.expect("motion failure should be recorded");
        assert!(last_error.starts_with("motion:"), "unexpected error: {last_error}");
    }

    #[tokio::test]
    async fn capture_failure_is_recorded_and_recoverable() {
        let harness = Harness::launch(&[(Program::Vid, LIVE)], SettingsStore::new()).await;

        harness.control.start().await;
        let status = harness.control.status();
        assert!(!status.running);
        assert_eq!(status.state, ControlState::Idle);
        assert!(status.last_error.is_some());

        harness.control.set_mode(Mode::Stream).await;
        harness.control.start().await;
        let status = harness.control.status();
        assert!(status.running);
        assert!(status.stream_running);
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn overlapping_starts_run_one_after_another() {
        let harness = Harness::launch(
            &[(Program::Still, LIVE), (Program::Vid, LIVE)],
            SettingsStore::new(),
        )
        .await;
        let control = &harness.control;

        tokio::join!(control.start(), control.start(), control.restart_stream());

        let launches = harness.launches();
        for launch in launches.iter().filter(|launch| launch.program == Program::Still) {
            assert!(
                launch.alive_before.is_empty(),
                "capture launched while {:?} were alive",
                launch.alive_before
            );
        }
        let alive = launches
            .iter()
            .filter_map(|launch| launch.pid)
            .filter(|pid| is_alive(*pid))
            .count();
        assert_eq!(alive, 2, "one capture and one stream should remain");
        let status = control.status();
        assert!(status.running);
        assert!(status.stream_running);
    }

    #[tokio::test]
    async fn stop_cuts_an_in_flight_start_short() {
        let harness = Harness::launch(
            &[(Program::Still, "exec sleep 30"), (Program::Vid, LIVE)],
            SettingsStore::new(),
        )
        .await;
        let control = harness.control.clone();

        let pending = tokio::spawn(async move { control.start().await });
        assert!(eventually(|| harness.control.status().running).await);

        harness.control.stop().await;
        timeout(Duration::from_secs(5), pending)
            .await
            .expect("start should settle once stopped")
            .expect("start task should not panic");
        assert!(!harness.control.status().running);
    }

    #[tokio::test]
    async fn stop_during_the_stop_phase_cancels_the_capture() {
        let harness = Harness::launch(
            &[(Program::Still, LIVE), (Program::Vid, LIVE)],
            SettingsStore::new(),
        )
        .await;
        let control = &harness.control;

        tokio::join!(control.start(), async {
            yield_now().await;
            control.stop().await;
        });

        let status = control.status();
        assert!(!status.running, "stop should win over the pending start");
        assert_eq!(status.state, ControlState::Idle);
        assert!(status.stream_running, "the live feed should come back");
        let alive_captures = harness
            .launches()
            .iter()
            .filter(|launch| launch.program == Program::Still)
            .filter_map(|launch| launch.pid)
            .filter(|pid| is_alive(*pid))
            .count();
        assert_eq!(alive_captures, 0);
    }

    #[tokio::test]
    async fn mode_switch_during_start_skips_the_stale_capture() {
        let harness = Harness::launch(
            &[(Program::Still, LIVE), (Program::Vid, LIVE)],
            SettingsStore::new(),
        )
        .await;
        let control = &harness.control;

        tokio::join!(control.start(), control.set_mode(Mode::Video));

        let status = control.status();
        assert_eq!(status.mode, Mode::Video);
        assert!(!status.running);
        assert!(status.stream_running);
        assert!(
            harness
                .launches()
                .iter()
                .all(|launch| launch.program != Program::Still),
            "photo capture launched after the switch to video"
        );

        control.start().await;
        let status = control.status();
        assert_eq!(status.mode, Mode::Video);
        assert!(status.running);
    }
}
