//! Supervisor-side worker plumbing: spawning isolated workers and pumping
//! frames between them and the router.
//!
//! Every worker gets a bounded outbound queue drained by a writer, and shares
//! one unbounded inbound queue with all other workers. Per worker the inbound
//! queue is FIFO; a final [`Inbound::Closed`] is always delivered once the
//! worker's output ends, whether it exited, crashed or panicked.

use crate::protocol::{Frame, WORKER_ID_ENV};
use crate::sdk::{run_plugin, ChannelSink, Plugin, PluginContext};
use jukebox_core::{PluginDescriptor, WorkerId};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use thiserror::Error;

/// Message delivered to the router's inbound queue.
#[derive(Debug)]
pub enum Inbound {
    /// A frame emitted by a worker.
    Frame { worker: WorkerId, frame: Frame },
    /// The worker's output ended; nothing more will arrive from it.
    Closed { worker: WorkerId },
    /// Stop request from outside the bus (e.g. an OS signal).
    Interrupt { reason: String },
}

/// Errors from starting a worker.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn plugin process for '{worker}': {source}")]
    Process {
        worker: WorkerId,
        source: std::io::Error,
    },
    #[error("plugin process for '{0}' has no stdin")]
    NoStdin(WorkerId),
    #[error("plugin process for '{0}' has no stdout")]
    NoStdout(WorkerId),
    #[error("failed to start thread for '{worker}': {source}")]
    Thread {
        worker: WorkerId,
        source: std::io::Error,
    },
}

/// Errors from handing a frame to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("worker queue is full")]
    Full,
    #[error("worker channel is closed")]
    Closed,
}

/// Configuration for an external plugin process.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Path to the plugin executable.
    pub executable: PathBuf,
    /// Arguments to pass to the plugin.
    pub args: Vec<String>,
    /// Working directory for the plugin process.
    pub working_dir: Option<PathBuf>,
    /// Environment variables to set for the plugin.
    pub env: Vec<(String, String)>,
}

impl From<&PluginDescriptor> for ExecConfig {
    fn from(descriptor: &PluginDescriptor) -> Self {
        Self {
            executable: descriptor.executable.clone(),
            args: descriptor.args.clone(),
            working_dir: descriptor.working_dir.clone(),
            env: descriptor
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// Builds an in-process plugin on its worker thread.
pub type PluginFactory = Box<dyn FnOnce() -> Box<dyn Plugin> + Send>;

/// How a worker is started.
pub enum Launch {
    /// A separate OS process talking JSON lines over stdin/stdout.
    Exec(ExecConfig),
    /// A plugin compiled into the supervisor, isolated on its own thread.
    InProcess(PluginFactory),
}

impl Launch {
    pub fn in_process<P, F>(factory: F) -> Self
    where
        P: Plugin + 'static,
        F: FnOnce() -> P + Send + 'static,
    {
        Launch::InProcess(Box::new(move || Box::new(factory()) as Box<dyn Plugin>))
    }
}

impl std::fmt::Debug for Launch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Launch::Exec(config) => f.debug_tuple("Exec").field(config).finish(),
            Launch::InProcess(_) => f.write_str("InProcess"),
        }
    }
}

/// Router-side sending half of a worker channel.
#[derive(Debug)]
pub struct WorkerChannel {
    outbound: SyncSender<Frame>,
}

impl WorkerChannel {
    /// Queue `frame` for the worker without blocking.
    pub fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        self.outbound.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => ChannelError::Full,
            TrySendError::Disconnected(_) => ChannelError::Closed,
        })
    }

    /// A channel backed by a plain queue, for exercising router logic.
    pub fn detached(capacity: usize) -> (Self, Receiver<Frame>) {
        let (outbound, rx) = mpsc::sync_channel(capacity);
        (Self { outbound }, rx)
    }
}

/// What happened when a worker was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyExited,
    Killed,
    /// Threads cannot be killed; the thread was left to finish on its own.
    Detached,
}

/// The execution unit behind a worker.
#[derive(Debug)]
pub enum Execution {
    Process(Child),
    Thread(Option<JoinHandle<()>>),
}

impl Execution {
    pub fn has_exited(&mut self) -> bool {
        match self {
            Execution::Process(child) => !matches!(child.try_wait(), Ok(None)),
            Execution::Thread(handle) => handle.as_ref().map_or(true, |h| h.is_finished()),
        }
    }

    /// Stop now: reap an exited unit, kill a running process, detach a
    /// running thread.
    pub fn stop(&mut self) -> StopOutcome {
        match self {
            Execution::Process(child) => {
                let outcome = match child.try_wait() {
                    Ok(Some(_)) => StopOutcome::AlreadyExited,
                    _ => {
                        if let Err(err) = child.kill() {
                            tracing::debug!(error = %err, "kill failed");
                        }
                        StopOutcome::Killed
                    }
                };
                if let Err(err) = child.wait() {
                    tracing::debug!(error = %err, "wait failed");
                }
                outcome
            }
            Execution::Thread(handle) => match handle.take() {
                Some(h) if h.is_finished() => {
                    // A panic was already reported through the close guard.
                    let _ = h.join();
                    StopOutcome::AlreadyExited
                }
                Some(_) => StopOutcome::Detached,
                None => StopOutcome::AlreadyExited,
            },
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            Execution::Process(child) => Some(child.id()),
            Execution::Thread(_) => None,
        }
    }
}

/// A freshly started worker.
#[derive(Debug)]
pub struct SpawnedWorker {
    pub channel: WorkerChannel,
    pub execution: Execution,
}

/// Start `worker` and wire it to `inbound`.
pub fn spawn(
    worker: &WorkerId,
    launch: Launch,
    inbound: &Sender<Inbound>,
    capacity: usize,
) -> Result<SpawnedWorker, SpawnError> {
    match launch {
        Launch::Exec(config) => spawn_process(worker, &config, inbound, capacity),
        Launch::InProcess(factory) => spawn_thread(worker, factory, inbound, capacity),
    }
}

fn spawn_process(
    worker: &WorkerId,
    config: &ExecConfig,
    inbound: &Sender<Inbound>,
    capacity: usize,
) -> Result<SpawnedWorker, SpawnError> {
    let mut cmd = Command::new(&config.executable);
    cmd.args(&config.args)
        .env(WORKER_ID_ENV, worker.as_str())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    if let Some(ref dir) = config.working_dir {
        cmd.current_dir(dir);
    }

    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(|source| SpawnError::Process {
        worker: worker.clone(),
        source,
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| SpawnError::NoStdin(worker.clone()));
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SpawnError::NoStdout(worker.clone()));
    let (stdin, stdout) = match (stdin, stdout) {
        (Ok(stdin), Ok(stdout)) => (stdin, stdout),
        (Err(err), _) | (_, Err(err)) => {
            Execution::Process(child).stop();
            return Err(err);
        }
    };

    let (outbound, rx) = mpsc::sync_channel(capacity);
    let pumps = start_thread(worker, "reader", {
        let guard = CloseGuard::new(worker.clone(), inbound.clone());
        move || read_frames(stdout, guard)
    })
    .and_then(|_| start_thread(worker, "writer", move || write_frames(stdin, rx)));
    if let Err(err) = pumps {
        Execution::Process(child).stop();
        return Err(err);
    }

    tracing::info!(worker = %worker, pid = child.id(), executable = %config.executable.display(), "spawned plugin process");
    Ok(SpawnedWorker {
        channel: WorkerChannel { outbound },
        execution: Execution::Process(child),
    })
}

fn spawn_thread(
    worker: &WorkerId,
    factory: PluginFactory,
    inbound: &Sender<Inbound>,
    capacity: usize,
) -> Result<SpawnedWorker, SpawnError> {
    let (outbound, rx) = mpsc::sync_channel(capacity);
    let guard = CloseGuard::new(worker.clone(), inbound.clone());
    let sink = ChannelSink::new(worker.clone(), inbound.clone());
    let id = worker.clone();

    let handle = start_thread(worker, "plugin", move || {
        let _guard = guard;
        let mut plugin = factory();
        let mut ctx = PluginContext::new(id.clone(), sink);
        if let Err(err) = run_plugin(plugin.as_mut(), &mut ctx, rx) {
            tracing::warn!(worker = %id, error = %err, "in-process plugin stopped with an error");
        }
    })?;

    tracing::info!(worker = %worker, "spawned in-process plugin");
    Ok(SpawnedWorker {
        channel: WorkerChannel { outbound },
        execution: Execution::Thread(Some(handle)),
    })
}

fn start_thread<F>(worker: &WorkerId, role: &str, body: F) -> Result<JoinHandle<()>, SpawnError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(format!("{worker}-{role}"))
        .spawn(body)
        .map_err(|source| SpawnError::Thread {
            worker: worker.clone(),
            source,
        })
}

fn read_frames(stdout: ChildStdout, guard: CloseGuard) {
    for line in BufReader::new(stdout).lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(worker = %guard.worker, error = %err, "failed to read from plugin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match Frame::decode(&line) {
            Ok(frame) => {
                let message = Inbound::Frame {
                    worker: guard.worker.clone(),
                    frame,
                };
                if guard.inbound.send(message).is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(worker = %guard.worker, error = %err, "ignoring malformed frame from plugin");
            }
        }
    }
}

fn write_frames(mut stdin: ChildStdin, frames: Receiver<Frame>) {
    for frame in frames {
        let line = match frame.encode() {
            Ok(line) => line,
            Err(err) => {
                tracing::error!(error = %err, "dropping unencodable frame");
                continue;
            }
        };
        if writeln!(stdin, "{line}").and_then(|_| stdin.flush()).is_err() {
            break;
        }
    }
}

/// Reports [`Inbound::Closed`] when dropped, including during a panic.
struct CloseGuard {
    worker: WorkerId,
    inbound: Sender<Inbound>,
}

impl CloseGuard {
    fn new(worker: WorkerId, inbound: Sender<Inbound>) -> Self {
        Self { worker, inbound }
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        let _ = self.inbound.send(Inbound::Closed {
            worker: self.worker.clone(),
        });
    }
}
