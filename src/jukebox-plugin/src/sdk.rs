//! Worker-side half of the bus: the [`Plugin`] trait and its run loop.
//!
//! A plugin process (or an in-process worker thread) goes through the same
//! lifecycle:
//!
//! 1. `on_init` runs once; this is where a plugin calls
//!    [`PluginContext::register`].
//! 2. `ready` is sent, followed by `idle` unless the plugin marked itself busy.
//! 3. Inbound frames are dispatched: `tick` to `on_tick`, `terminate` to
//!    `on_terminate` (after which the loop ends), everything else to
//!    `on_event`.
//!
//! ```rust,ignore
//! struct Beeper;
//!
//! impl Plugin for Beeper {
//!     fn on_init(&mut self, ctx: &mut PluginContext) -> Result<(), PluginIoError> {
//!         ctx.register(["beep"])
//!     }
//!
//!     fn on_event(&mut self, frame: &Frame, _ctx: &mut PluginContext) -> Result<(), PluginIoError> {
//!         play_beep(&frame.payload);
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<(), PluginIoError> {
//!     serve_stdio(Beeper)
//! }
//! ```

use crate::host::Inbound;
use crate::protocol::{Frame, FrameError, WORKER_ID_ENV};
use jukebox_core::{names, PayloadValue, WorkerId};
use std::io::{BufRead, Write};
use std::sync::mpsc::Sender;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginIoError {
    #[error("failed to write to the supervisor: {0}")]
    Write(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("supervisor channel is closed")]
    Disconnected,
}

/// Behaviour of one plugin. Only `on_event` is mandatory.
pub trait Plugin: Send {
    fn on_init(&mut self, _ctx: &mut PluginContext) -> Result<(), PluginIoError> {
        Ok(())
    }

    fn on_event(&mut self, frame: &Frame, ctx: &mut PluginContext) -> Result<(), PluginIoError>;

    fn on_tick(&mut self, _ctx: &mut PluginContext) -> Result<(), PluginIoError> {
        Ok(())
    }

    /// Last chance to tidy up before the worker exits.
    fn on_terminate(&mut self, _ctx: &mut PluginContext) -> Result<(), PluginIoError> {
        Ok(())
    }
}

/// Where a plugin's outgoing frames go.
pub trait FrameSink: Send {
    fn send(&mut self, frame: Frame) -> Result<(), PluginIoError>;
}

/// Writes JSON lines to the process' stdout.
pub struct StdoutSink {
    stdout: std::io::Stdout,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            stdout: std::io::stdout(),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSink for StdoutSink {
    fn send(&mut self, frame: Frame) -> Result<(), PluginIoError> {
        let line = frame.encode()?;
        let mut lock = self.stdout.lock();
        writeln!(lock, "{line}")?;
        lock.flush()?;
        Ok(())
    }
}

/// Feeds the supervisor's inbound queue directly (in-process workers).
pub struct ChannelSink {
    worker: WorkerId,
    inbound: Sender<Inbound>,
}

impl ChannelSink {
    pub fn new(worker: WorkerId, inbound: Sender<Inbound>) -> Self {
        Self { worker, inbound }
    }
}

impl FrameSink for ChannelSink {
    fn send(&mut self, frame: Frame) -> Result<(), PluginIoError> {
        self.inbound
            .send(Inbound::Frame {
                worker: self.worker.clone(),
                frame,
            })
            .map_err(|_| PluginIoError::Disconnected)
    }
}

/// Handle a plugin uses to talk to the supervisor.
pub struct PluginContext {
    worker: WorkerId,
    sink: Box<dyn FrameSink>,
    busy: bool,
}

impl PluginContext {
    pub fn new(worker: WorkerId, sink: impl FrameSink + 'static) -> Self {
        Self {
            worker,
            sink: Box::new(sink),
            busy: false,
        }
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    pub fn emit(&mut self, frame: Frame) -> Result<(), PluginIoError> {
        self.sink.send(frame)
    }

    /// Subscribe to the given event names.
    pub fn register<I, S>(&mut self, events: I) -> Result<(), PluginIoError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscription_frame(names::REGISTER, events)
    }

    pub fn unregister<I, S>(&mut self, events: I) -> Result<(), PluginIoError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscription_frame(names::UNREGISTER, events)
    }

    /// Mark this worker busy; repeated calls send nothing.
    pub fn set_busy(&mut self) -> Result<(), PluginIoError> {
        if !self.busy {
            self.emit(Frame::new(names::BUSY))?;
            self.busy = true;
        }
        Ok(())
    }

    /// Mark this worker idle; repeated calls send nothing.
    pub fn set_idle(&mut self) -> Result<(), PluginIoError> {
        if self.busy {
            self.emit(Frame::new(names::IDLE))?;
            self.busy = false;
        }
        Ok(())
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Ask the supervisor to power the box off.
    pub fn request_shutdown(&mut self) -> Result<(), PluginIoError> {
        self.emit(Frame::new(names::SHUTDOWN))
    }

    /// Ask the supervisor to stop this worker.
    pub fn terminate_self(&mut self) -> Result<(), PluginIoError> {
        let target = self.worker.to_string();
        self.emit(Frame::terminate().with_field(names::TARGET_FIELD, target))
    }

    fn subscription_frame<I, S>(&mut self, name: &str, events: I) -> Result<(), PluginIoError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let events: Vec<String> = events.into_iter().map(Into::into).collect();
        self.emit(Frame::new(name).with_field(names::EVENTS_FIELD, PayloadValue::List(events)))
    }
}

/// Drive `plugin` until `terminate` arrives or `inbound` runs dry.
pub fn run_plugin<P, I>(
    plugin: &mut P,
    ctx: &mut PluginContext,
    inbound: I,
) -> Result<(), PluginIoError>
where
    P: Plugin + ?Sized,
    I: IntoIterator<Item = Frame>,
{
    plugin.on_init(ctx)?;
    ctx.emit(Frame::ready())?;
    if !ctx.is_busy() {
        ctx.emit(Frame::new(names::IDLE))?;
    }

    for frame in inbound {
        match frame.name.as_str() {
            names::TICK => plugin.on_tick(ctx)?,
            names::TERMINATE => {
                plugin.on_terminate(ctx)?;
                tracing::debug!(worker = %ctx.worker(), "plugin terminated");
                return Ok(());
            }
            _ => plugin.on_event(&frame, ctx)?,
        }
    }

    tracing::debug!(worker = %ctx.worker(), "supervisor channel closed");
    Ok(())
}

/// Run `plugin` as a worker process speaking the JSON-lines protocol on
/// stdin/stdout.
pub fn serve_stdio<P: Plugin>(mut plugin: P) -> Result<(), PluginIoError> {
    let worker = WorkerId::new(std::env::var(WORKER_ID_ENV).unwrap_or_else(|_| "plugin".into()));
    let mut ctx = PluginContext::new(worker, StdoutSink::new());
    let stdin = std::io::stdin();
    let frames = stdin
        .lock()
        .lines()
        .map_while(Result::ok)
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match Frame::decode(&line) {
            Ok(frame) => Some(frame),
            Err(err) => {
                tracing::warn!(error = %err, "ignoring malformed frame from supervisor");
                None
            }
        });
    run_plugin(&mut plugin, &mut ctx, frames)
}
