use crate::ticks::TickSchedule;
use jukebox_core::{Event, PluginDescriptor, WorkerId};
use jukebox_plugin::{
    ChannelError, ExecConfig, Execution, Frame, Launch, Plugin, StopOutcome, WorkerChannel,
};
use std::time::{Duration, Instant};

/// Last activity a worker reported. Workers that never report count as busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Unknown,
    Busy,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Spawned, `ready` not yet received.
    Starting,
    Active,
}

/// What the router needs to start one worker.
#[derive(Debug)]
pub struct WorkerSpec {
    pub id: WorkerId,
    pub launch: Launch,
    pub tick_interval: Option<Duration>,
}

impl WorkerSpec {
    pub fn from_descriptor(name: &str, descriptor: &PluginDescriptor) -> Self {
        Self {
            id: WorkerId::new(name),
            launch: Launch::Exec(ExecConfig::from(descriptor)),
            tick_interval: descriptor.tick_interval(),
        }
    }

    pub fn in_process<P, F>(id: impl Into<WorkerId>, factory: F) -> Self
    where
        P: Plugin + 'static,
        F: FnOnce() -> P + Send + 'static,
    {
        Self {
            id: id.into(),
            launch: Launch::in_process(factory),
            tick_interval: None,
        }
    }

    /// A zero interval disables ticks.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = Some(interval).filter(|interval| !interval.is_zero());
        self
    }
}

/// Supervisor-side state of one running plugin.
#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    pub(crate) channel: WorkerChannel,
    execution: Execution,
    pub(crate) tick: Option<TickSchedule>,
    pub(crate) activity: Activity,
    pub(crate) phase: Phase,
    terminating: bool,
    terminate_deadline: Option<Instant>,
    exited_at: Option<Instant>,
}

impl WorkerHandle {
    pub fn new(
        id: WorkerId,
        channel: WorkerChannel,
        execution: Execution,
        tick: Option<TickSchedule>,
    ) -> Self {
        Self {
            id,
            channel,
            execution,
            tick,
            activity: Activity::Unknown,
            phase: Phase::Starting,
            terminating: false,
            terminate_deadline: None,
            exited_at: None,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn activity(&self) -> Activity {
        self.activity
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// When the worker's process was first seen to have exited. A helper the
    /// plugin started may still hold its stdout open, so the channel alone
    /// does not tell. Thread workers report their end through the close
    /// guard and always return `None`.
    pub fn exit_noticed(&mut self, now: Instant) -> Option<Instant> {
        if self.exited_at.is_none()
            && matches!(self.execution, Execution::Process(_))
            && self.execution.has_exited()
        {
            self.exited_at = Some(now);
        }
        self.exited_at
    }

    /// Queue `event` for this worker without blocking.
    pub fn send(&self, event: &Event) -> Result<(), ChannelError> {
        self.channel.send(Frame::from(event))
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating
    }

    pub fn terminate_deadline(&self) -> Option<Instant> {
        self.terminate_deadline
    }

    /// Ask the worker to exit by `deadline`; `None` waits indefinitely. A
    /// repeated request can only bring the deadline forward.
    pub fn request_terminate(&mut self, deadline: Option<Instant>) {
        self.terminate_deadline = match (self.terminate_deadline, deadline) {
            (Some(existing), Some(deadline)) => Some(existing.min(deadline)),
            (existing, deadline) => existing.or(deadline),
        };
        if self.terminating {
            return;
        }
        self.terminating = true;
        match self.channel.send(Frame::terminate()) {
            Ok(()) => tracing::debug!(worker = %self.id, "terminate requested"),
            Err(err) => {
                tracing::debug!(worker = %self.id, error = %err, "terminate not delivered")
            }
        }
    }

    pub fn is_overdue(&self, now: Instant) -> bool {
        self.terminate_deadline
            .is_some_and(|deadline| now >= deadline)
    }

    /// Release the execution unit, killing it if it is still running.
    pub fn stop(mut self) -> StopOutcome {
        let outcome = self.execution.stop();
        match outcome {
            StopOutcome::AlreadyExited => {
                tracing::debug!(worker = %self.id, "worker reaped")
            }
            StopOutcome::Killed => tracing::warn!(worker = %self.id, "worker killed"),
            StopOutcome::Detached => {
                tracing::warn!(worker = %self.id, "worker thread did not stop, detached")
            }
        }
        outcome
    }
}
