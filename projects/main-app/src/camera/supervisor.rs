use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::AsyncReadExt,
    process::{Child, ChildStdout},
    sync::{broadcast, mpsc, oneshot, watch},
    time::timeout,
};
use tokio_stream::{Stream, StreamExt, wrappers::BroadcastStream};
use tracing::{Instrument, Span, debug, error, info, warn};

use super::{args, modes::ProcessSpec, traits::CaptureBackend};
use crate::core::errors::ProcessError;

const READ_BUFFER_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Action,
    Stream,
    Motion,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessRole::Action => "action",
            ProcessRole::Stream => "stream",
            ProcessRole::Motion => "motion",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    /// Treat the process as started on its first stdout chunk instead of
    /// waiting for it to exit.
    pub early_resolution: bool,
    /// A process still alive after this long counts as started.
    pub settle_timeout: Option<Duration>,
    pub output_capacity: usize,
}

/// Failure of a process that had already been reported as started.
pub type FailureReport = (ProcessRole, ProcessError);

/// Long-lived handle on a supervisor's stdout. It survives restarts, so a
/// consumer sees a gap rather than an end while the process cycles.
/// Slow consumers drop the oldest chunks; the producer never waits.
#[derive(Debug, Clone)]
pub struct OutputStream {
    tx: broadcast::Sender<Bytes>,
}

impl OutputStream {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    fn push(&self, chunk: Bytes) {
        // No receivers means nobody is watching; the chunk is dropped.
        let _ = self.tx.send(chunk);
    }

    pub fn into_stream(self) -> impl Stream<Item = Bytes> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|item| match item {
            Ok(chunk) => Some(chunk),
            Err(err) => {
                warn!("live stream consumer dropped chunks: {err}");
                None
            }
        })
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One-shot result of `start`, settled by whichever producer gets there first.
#[derive(Clone)]
struct StartSignal {
    tx: Arc<Mutex<Option<oneshot::Sender<Result<(), ProcessError>>>>>,
}

impl StartSignal {
    fn new() -> (Self, oneshot::Receiver<Result<(), ProcessError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Returns `Err(result)` when the signal was already settled.
    fn settle(&self, result: Result<(), ProcessError>) -> Result<(), Result<(), ProcessError>> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match tx {
            // A dropped receiver means the caller stopped waiting; still settled.
            Some(tx) => {
                let _ = tx.send(result);
                Ok(())
            }
            None => Err(result),
        }
    }
}

struct RunningProcess {
    generation: u64,
    pid: Option<u32>,
    cancel_tx: watch::Sender<bool>,
}

struct SlotState {
    running: Option<RunningProcess>,
    /// Flips to `true` once the latest process has been reaped. Every
    /// stopper waits on it, not only the one that took the handle.
    reaped: watch::Receiver<bool>,
}

type Slot = Arc<Mutex<SlotState>>;

pub struct ProcessSupervisor<B: CaptureBackend> {
    role: ProcessRole,
    backend: Arc<B>,
    options: SupervisorOptions,
    output: OutputStream,
    slot: Slot,
    generation: AtomicU64,
    failures: mpsc::UnboundedSender<FailureReport>,
    span: Span,
}

impl<B: CaptureBackend> ProcessSupervisor<B> {
    pub fn new(
        role: ProcessRole,
        backend: Arc<B>,
        options: SupervisorOptions,
        failures: mpsc::UnboundedSender<FailureReport>,
        span: Span,
    ) -> Self {
        Self {
            role,
            backend,
            output: OutputStream::new(options.output_capacity),
            options,
            slot: Arc::new(Mutex::new(SlotState {
                running: None,
                reaped: watch::channel(true).1,
            })),
            generation: AtomicU64::new(0),
            failures,
            span,
        }
    }

    /// Launches `spec` in this slot. The caller must `stop` first if a
    /// process is still running here.
    pub async fn start(&self, spec: ProcessSpec) -> Result<(), ProcessError> {
        let program = self.backend.binary(spec.program);
        let tokens = args::encode(&spec.arguments);
        self.span.in_scope(|| info!(program = %program, args = %tokens.join(" "), "starting process"));

        let mut child = self
            .backend
            .spawn(spec.program, &tokens)
            .await
            .map_err(|source| {
                self.span.in_scope(|| error!(program = %program, "spawn failed: {source}"));
                ProcessError::SpawnFailure {
                    program: program.clone(),
                    source,
                }
            })?;

        let pid = child.id();
        let stdout = child.stdout.take();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (reaped_tx, reaped_rx) = watch::channel(false);
        let (signal, mut started_rx) = StartSignal::new();

        {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            slot.running = Some(RunningProcess {
                generation,
                pid,
                cancel_tx,
            });
            slot.reaped = reaped_rx;
        }

        if let Some(stdout) = stdout {
            let reader = OutputReader {
                role: self.role,
                program: program.clone(),
                output: self.output.clone(),
                signal: self.options.early_resolution.then(|| signal.clone()),
                failures: self.failures.clone(),
            };
            tokio::spawn(
                reader
                    .run(stdout, cancel_rx.clone())
                    .instrument(self.span.clone()),
            );
        }

        let watcher = ExitWatcher {
            role: self.role,
            program: program.clone(),
            generation,
            slot: self.slot.clone(),
            signal: signal.clone(),
            failures: self.failures.clone(),
        };
        tokio::spawn(
            watcher
                .run(child, cancel_rx, reaped_tx)
                .instrument(self.span.clone()),
        );

        let received = match self.options.settle_timeout {
            Some(limit) => match timeout(limit, &mut started_rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.span.in_scope(|| debug!(pid, "no output before settle timeout"));
                    let _ = signal.settle(Ok(()));
                    started_rx.await
                }
            },
            None => started_rx.await,
        };
        let result = received.unwrap_or_else(|_| {
            Err(ProcessError::RuntimeFailure {
                program: program.clone(),
                message: "supervisor tasks ended without a result".to_owned(),
            })
        });
        match &result {
            Ok(()) => self.span.in_scope(|| info!(program = %program, pid, "process started")),
            // A process that failed to start must not linger in the slot.
            Err(_) => self.stop().await,
        }
        result
    }

    /// Kills and reaps the running process, if any. Safe to call repeatedly
    /// and concurrently: every caller returns only after the reap.
    pub async fn stop(&self) {
        let (running, mut reaped) = {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            (slot.running.take(), slot.reaped.clone())
        };

        if let Some(running) = &running {
            self.span.in_scope(|| info!(pid = running.pid, "stopping process"));
            let _ = running.cancel_tx.send(true);
        }
        let watcher_gone = reaped.wait_for(|done| *done).await.is_err();
        if watcher_gone {
            self.span.in_scope(|| warn!("exit watcher dropped before reaping"));
        }
    }

    pub fn running(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .running
            .is_some()
    }

    pub fn output(&self) -> OutputStream {
        self.output.clone()
    }
}

struct OutputReader {
    role: ProcessRole,
    program: String,
    output: OutputStream,
    signal: Option<StartSignal>,
    failures: mpsc::UnboundedSender<FailureReport>,
}

impl OutputReader {
    async fn run(mut self, mut stdout: ChildStdout, mut cancel_rx: watch::Receiver<bool>) {
        let mut buffer = vec![0_u8; READ_BUFFER_BYTES];
        // Once the watcher drops the handle after a natural exit, keep reading
        // until EOF so the tail of the output is not lost.
        let mut watching = true;
        loop {
            tokio::select! {
                changed = cancel_rx.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                    } else if *cancel_rx.borrow() {
                        break;
                    }
                }
                read = stdout.read(&mut buffer) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Some(signal) = self.signal.take() {
                            let _ = signal.settle(Ok(()));
                        }
                        self.output.push(Bytes::copy_from_slice(&buffer[..n]));
                    }
                    Err(err) => {
                        let failure = ProcessError::RuntimeFailure {
                            program: self.program.clone(),
                            message: format!("stdout read failed: {err}"),
                        };
                        let unsettled = match self.signal.take() {
                            Some(signal) => signal.settle(Err(failure)),
                            None => Err(Err(failure)),
                        };
                        if let Err(Err(failure)) = unsettled {
                            error!("{failure}");
                            let _ = self.failures.send((self.role, failure));
                        }
                        break;
                    }
                }
            }
        }
        debug!("output reader finished");
    }
}

struct ExitWatcher {
    role: ProcessRole,
    program: String,
    generation: u64,
    slot: Slot,
    signal: StartSignal,
    failures: mpsc::UnboundedSender<FailureReport>,
}

impl ExitWatcher {
    async fn run(
        self,
        mut child: Child,
        mut cancel_rx: watch::Receiver<bool>,
        reaped_tx: watch::Sender<bool>,
    ) {
        let outcome = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel_rx.changed() => None,
        };

        let result = match outcome {
            None => {
                if let Err(err) = child.kill().await {
                    warn!("failed to kill {}: {err}", self.program);
                }
                let _ = self.signal.settle(Ok(()));
                reaped_tx.send_replace(true);
                return;
            }
            Some(Ok(status)) if status.success() => {
                info!(%status, "process exited");
                Ok(())
            }
            Some(Ok(status)) => Err(ProcessError::UnexpectedExit {
                program: self.program.clone(),
                status: status.to_string(),
            }),
            Some(Err(err)) => Err(ProcessError::RuntimeFailure {
                program: self.program.clone(),
                message: format!("wait failed: {err}"),
            }),
        };

        {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            if slot
                .running
                .as_ref()
                .is_some_and(|running| running.generation == self.generation)
            {
                slot.running = None;
            }
        }

        if let Err(Err(failure)) = self.signal.settle(result) {
            error!("{failure}");
            let _ = self.failures.send((self.role, failure));
        }
        reaped_tx.send_replace(true);
    }
}
