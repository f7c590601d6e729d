//! The supervisor's main loop.
//!
//! One [`Router`] owns every worker handle, the subscription index, the event
//! map and the idle controller. Workers only influence it through messages on
//! the shared inbound queue, and the loop only blocks in `recv_timeout` on
//! that queue.

use crate::error::BusError;
use crate::eventmap::EventMap;
use crate::idle::{IdleController, Transition};
use crate::registry::{parse_subscription, Registry, RegistryError};
use crate::ticks::{self, TickSchedule};
use crate::worker::{Activity, Phase, WorkerHandle, WorkerSpec};
use jukebox_core::{names, CoreConfig, Event, Origin, PayloadValue, WorkerId};
use jukebox_plugin::{host, ChannelError, Frame, Inbound, PROTOCOL_VERSION, PROTOCOL_VERSION_FIELD};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

/// How long frames of an exited process may still trail in after the exit
/// was noticed.
const EXIT_LINGER: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub idle_timeout: Duration,
    pub debug: bool,
    pub max_poll_interval: Duration,
    pub max_drain_per_iteration: usize,
    pub channel_capacity: usize,
    pub terminate_grace: Duration,
    pub shutdown_timeout: Duration,
    pub startup_timeout: Duration,
}

impl From<&CoreConfig> for RouterConfig {
    fn from(core: &CoreConfig) -> Self {
        Self {
            idle_timeout: core.idle_timeout(),
            debug: core.debug,
            max_poll_interval: core.max_poll_interval(),
            max_drain_per_iteration: core.max_drain_per_iteration.max(1),
            channel_capacity: core.channel_capacity.max(1),
            terminate_grace: core.terminate_grace(),
            shutdown_timeout: core.shutdown_timeout(),
            startup_timeout: core.startup_timeout(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::from(&CoreConfig::default())
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Interrupted by a signal or an untargeted `terminate`.
    Stopped,
    /// Idle timeout or a `shutdown` request; the host should power off.
    PowerOff,
    /// The registry became inconsistent.
    Fault(RegistryError),
}

/// Lets another thread stop a running [`Router`].
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    inbound: Sender<Inbound>,
}

impl InterruptHandle {
    /// Returns `false` if the router is already gone.
    pub fn interrupt(&self, reason: impl Into<String>) -> bool {
        self.inbound
            .send(Inbound::Interrupt {
                reason: reason.into(),
            })
            .is_ok()
    }
}

#[derive(Debug)]
struct Stopping {
    outcome: RunOutcome,
    deadline: Option<Instant>,
}

/// Why a worker left the registry.
#[derive(Debug, Clone, Copy)]
enum Departure {
    ChannelClosed,
    ProcessExited,
}

pub struct Router {
    config: RouterConfig,
    eventmap: EventMap,
    registry: Registry,
    controller: IdleController,
    inbound_tx: Sender<Inbound>,
    inbound_rx: Receiver<Inbound>,
    loading: bool,
    startup_deadline: Option<Instant>,
    stopping: Option<Stopping>,
}

impl Router {
    pub fn new(config: RouterConfig, eventmap: EventMap) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel();
        Self {
            controller: IdleController::new(config.idle_timeout, config.debug),
            config,
            eventmap,
            registry: Registry::new(),
            inbound_tx,
            inbound_rx,
            loading: false,
            startup_deadline: None,
            stopping: None,
        }
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            inbound: self.inbound_tx.clone(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn controller(&self) -> &IdleController {
        &self.controller
    }

    pub fn eventmap(&self) -> &EventMap {
        &self.eventmap
    }

    /// Start one worker and add it to the registry.
    pub fn spawn(&mut self, spec: WorkerSpec) -> Result<(), BusError> {
        if self.registry.contains(&spec.id) {
            return Err(RegistryError::DuplicateWorker(spec.id).into());
        }
        let spawned_at = Instant::now();
        let spawned = host::spawn(
            &spec.id,
            spec.launch,
            &self.inbound_tx,
            self.config.channel_capacity,
        )?;
        let tick = spec
            .tick_interval
            .map(|interval| TickSchedule::new(interval, spawned_at));
        let handle = WorkerHandle::new(spec.id, spawned.channel, spawned.execution, tick);
        self.registry.insert(handle)?;
        Ok(())
    }

    /// Start every worker; failures are logged and skipped. Returns how many
    /// workers are running.
    pub fn spawn_all(&mut self, specs: impl IntoIterator<Item = WorkerSpec>) -> usize {
        for spec in specs {
            let id = spec.id.clone();
            if let Err(err) = self.spawn(spec) {
                tracing::error!(worker = %id, error = %err, "failed to start plugin");
            }
        }
        self.registry.len()
    }

    /// Run until every worker is gone after a stop request.
    pub fn run(mut self) -> RunOutcome {
        if self.registry.is_empty() {
            tracing::warn!("no plugins running, nothing to supervise");
            return RunOutcome::Stopped;
        }
        self.begin_loading(Instant::now());
        tracing::info!(workers = self.registry.len(), "router started");

        loop {
            if let Some(outcome) = self.iterate() {
                tracing::info!(?outcome, "router stopped");
                return outcome;
            }
        }
    }

    /// One pass: wait, drain a bounded batch of messages, then the timers.
    fn iterate(&mut self) -> Option<RunOutcome> {
        let timeout = self.next_timeout(Instant::now());
        match self.inbound_rx.recv_timeout(timeout) {
            Ok(message) => {
                self.handle_inbound(message, Instant::now());
                for _ in 1..self.config.max_drain_per_iteration {
                    let Ok(message) = self.inbound_rx.try_recv() else {
                        break;
                    };
                    self.handle_inbound(message, Instant::now());
                }
            }
            // The router keeps its own sender, so the queue never disconnects.
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {}
        }
        self.on_timers(Instant::now())
    }

    /// How long the next wait may block.
    pub fn next_timeout(&self, now: Instant) -> Duration {
        let mut wake_at = self
            .registry
            .handles()
            .filter_map(WorkerHandle::terminate_deadline)
            .chain(self.stopping.as_ref().and_then(|stopping| stopping.deadline))
            .min();
        if self.stopping.is_none() {
            wake_at = [
                wake_at,
                ticks::next_due(&self.registry),
                self.controller.deadline(),
                self.startup_deadline,
            ]
            .into_iter()
            .flatten()
            .min();
        }
        wake_at
            .map_or(self.config.max_poll_interval, |at| {
                at.saturating_duration_since(now)
            })
            .min(self.config.max_poll_interval)
    }

    pub fn handle_inbound(&mut self, message: Inbound, now: Instant) {
        match message {
            Inbound::Frame { worker, frame } => self.handle_frame(worker, frame, now),
            Inbound::Closed { worker } => self.handle_closed(&worker, now),
            Inbound::Interrupt { reason } => {
                tracing::info!(%reason, "interrupt received");
                self.begin_stop(RunOutcome::Stopped, now);
            }
        }
    }

    fn handle_frame(&mut self, worker: WorkerId, frame: Frame, now: Instant) {
        if !self.registry.contains(&worker) {
            tracing::debug!(worker = %worker, event = %frame.name, "frame from removed worker dropped");
            return;
        }
        let event = frame.into_event(Origin::Worker(worker.clone()));
        tracing::trace!(worker = %worker, event = event.name(), "received");

        match event.name() {
            names::REGISTER => self.change_subscriptions(&worker, &event, true),
            names::UNREGISTER => self.change_subscriptions(&worker, &event, false),
            names::BUSY => self.set_activity(&worker, Activity::Busy, now),
            names::IDLE => self.set_activity(&worker, Activity::Idle, now),
            names::READY => self.mark_ready(&worker, &event, now),
            names::TERMINATE => self.handle_terminate(&event, now),
            names::SHUTDOWN => {
                tracing::info!(worker = %worker, "power-off requested");
                self.begin_stop(RunOutcome::PowerOff, now);
            }
            names::TICK | names::FINISHED_LOADING => {
                tracing::warn!(worker = %worker, event = event.name(), "ignoring core event sent by a worker");
            }
            _ => self.dispatch(&event, now),
        }
    }

    /// Translate a raw event and fan the results out.
    fn dispatch(&mut self, raw: &Event, now: Instant) {
        for event in self.eventmap.translate(raw) {
            match event.name() {
                names::SHUTDOWN => {
                    tracing::info!(origin = %event.origin(), raw = raw.name(), "power-off requested");
                    self.begin_stop(RunOutcome::PowerOff, now);
                }
                names::TERMINATE => self.handle_terminate(&event, now),
                name if is_router_only(name) => {
                    tracing::warn!(origin = %event.origin(), event = name, "mapped event names a control message, dropped");
                }
                _ => {
                    self.deliver(&event);
                }
            }
        }
    }

    /// Send `event` to its subscribers in registration order. Returns how
    /// many accepted it.
    fn deliver(&self, event: &Event) -> usize {
        let mut delivered = 0;
        for id in self.registry.subscribers(event.name()) {
            let Some(handle) = self.registry.get(id) else {
                continue;
            };
            if handle.is_terminating() {
                continue;
            }
            match handle.send(event) {
                Ok(()) => delivered += 1,
                Err(ChannelError::Full) => {
                    tracing::error!(worker = %id, event = event.name(), "worker queue is full, event dropped");
                }
                Err(ChannelError::Closed) => {
                    tracing::debug!(worker = %id, event = event.name(), "worker channel closed, event not delivered");
                }
            }
        }
        tracing::debug!(event = event.name(), origin = %event.origin(), subscribers = delivered, "routed");
        delivered
    }

    fn change_subscriptions(&mut self, worker: &WorkerId, event: &Event, subscribe: bool) {
        let events = match parse_subscription(event.payload()) {
            Ok(events) => events,
            Err(source) => {
                let err = BusError::Subscription {
                    worker: worker.clone(),
                    source,
                };
                tracing::warn!(error = %err, "subscription change ignored");
                return;
            }
        };
        for name in events {
            if !subscribe {
                if self.registry.unsubscribe(worker, &name) {
                    tracing::debug!(worker = %worker, event = %name, "unsubscribed");
                }
                continue;
            }
            match self.registry.subscribe(worker, &name) {
                Ok(true) => tracing::debug!(worker = %worker, event = %name, "subscribed"),
                Ok(false) => {}
                Err(err) => tracing::warn!(worker = %worker, error = %err, "subscription failed"),
            }
        }
    }

    fn set_activity(&mut self, worker: &WorkerId, activity: Activity, now: Instant) {
        if let Some(handle) = self.registry.get_mut(worker) {
            handle.activity = activity;
        }
        self.observe_activity(now);
    }

    fn observe_activity(&mut self, now: Instant) {
        if self.stopping.is_some() {
            return;
        }
        match self.controller.observe(self.registry.all_idle(), now) {
            Some(Transition::BecameBusy) => {
                tracing::info!("box is busy");
                self.deliver(&Event::core(names::BUSY));
            }
            Some(Transition::BecameIdle { deadline }) => {
                tracing::info!(
                    power_off_in_secs = ?deadline.map(|at| at.saturating_duration_since(now).as_secs()),
                    debug = self.config.debug,
                    "box is idle"
                );
                self.deliver(&Event::core(names::IDLE));
            }
            None => {}
        }
    }

    /// A `ready` without a version is accepted; one announcing another
    /// version gets the worker terminated.
    fn mark_ready(&mut self, worker: &WorkerId, event: &Event, now: Instant) {
        let mismatch = event
            .field(PROTOCOL_VERSION_FIELD)
            .filter(|version| **version != PayloadValue::Integer(i64::from(PROTOCOL_VERSION)))
            .map(PayloadValue::to_string);
        let deadline = self.terminate_deadline(now);
        if let Some(handle) = self.registry.get_mut(worker) {
            if handle.phase == Phase::Starting {
                handle.phase = Phase::Active;
                tracing::debug!(worker = %worker, "worker ready");
            }
            if let Some(actual) = mismatch {
                let err = BusError::ProtocolMismatch {
                    worker: worker.clone(),
                    expected: PROTOCOL_VERSION,
                    actual,
                };
                tracing::error!(error = %err, "terminating incompatible worker");
                handle.request_terminate(deadline);
            }
        }
        self.maybe_finish_loading(now);
    }

    /// Enter the startup phase that ends with `finished_loading`.
    fn begin_loading(&mut self, now: Instant) {
        self.loading = true;
        self.startup_deadline = now.checked_add(self.config.startup_timeout);
    }

    /// Emit `finished_loading` once every worker is ready or the startup
    /// window has passed.
    fn maybe_finish_loading(&mut self, now: Instant) {
        if !self.loading {
            return;
        }
        let pending: Vec<&str> = self.registry.starting().map(WorkerId::as_str).collect();
        if !pending.is_empty() {
            if self.startup_deadline.map_or(true, |deadline| now < deadline) {
                return;
            }
            tracing::warn!(pending = %pending.join(", "), "startup window elapsed before every worker was ready");
        }
        self.loading = false;
        self.startup_deadline = None;
        tracing::info!(workers = self.registry.len(), "finished loading");
        self.deliver(&Event::core(names::FINISHED_LOADING));
    }

    fn handle_terminate(&mut self, event: &Event, now: Instant) {
        let Some(target) = event.field(names::TARGET_FIELD) else {
            tracing::info!(origin = %event.origin(), "terminate requested for every worker");
            self.begin_stop(RunOutcome::Stopped, now);
            return;
        };
        let target = WorkerId::new(target.to_string());
        let deadline = self.terminate_deadline(now);
        match self.registry.get_mut(&target) {
            Some(handle) => {
                tracing::info!(worker = %target, origin = %event.origin(), "terminating worker");
                handle.request_terminate(deadline);
            }
            None => {
                tracing::warn!(worker = %target, origin = %event.origin(), "terminate for unknown worker ignored");
            }
        }
    }

    /// `None` when neither the grace period nor the stop bound is
    /// representable.
    fn terminate_deadline(&self, now: Instant) -> Option<Instant> {
        let deadline = now.checked_add(self.config.terminate_grace);
        match self.stopping.as_ref().and_then(|stopping| stopping.deadline) {
            Some(bound) => Some(deadline.map_or(bound, |deadline| deadline.min(bound))),
            None => deadline,
        }
    }

    fn handle_closed(&mut self, worker: &WorkerId, now: Instant) {
        self.retire(worker, Departure::ChannelClosed, now);
    }

    /// Remove workers whose process exited a little while ago, whatever
    /// became of their output.
    fn remove_exited(&mut self, now: Instant) {
        let exited: Vec<WorkerId> = self
            .registry
            .handles_mut()
            .filter_map(|handle| {
                let noticed = handle.exit_noticed(now)?;
                (now.saturating_duration_since(noticed) >= EXIT_LINGER).then(|| handle.id().clone())
            })
            .collect();
        for id in exited {
            self.retire(&id, Departure::ProcessExited, now);
        }
    }

    fn retire(&mut self, worker: &WorkerId, departure: Departure, now: Instant) {
        let Some(handle) = self.registry.remove(worker) else {
            tracing::debug!(worker = %worker, ?departure, "worker already removed");
            return;
        };
        if handle.is_terminating() {
            tracing::info!(worker = %worker, "worker exited");
        } else {
            let worker = worker.clone();
            let err = match departure {
                Departure::ChannelClosed => BusError::ChannelClosedUnexpectedly { worker },
                Departure::ProcessExited => BusError::ExitedUnexpectedly { worker },
            };
            tracing::warn!(error = %err, "worker removed");
        }
        handle.stop();
        self.observe_activity(now);
        self.maybe_finish_loading(now);
    }

    /// Ask every worker to exit. The first stop request decides the outcome,
    /// except that a fault always wins.
    fn begin_stop(&mut self, outcome: RunOutcome, now: Instant) {
        if let Some(stopping) = self.stopping.as_mut() {
            if matches!(outcome, RunOutcome::Fault(_))
                && !matches!(stopping.outcome, RunOutcome::Fault(_))
            {
                stopping.outcome = outcome;
            }
            return;
        }

        match &outcome {
            RunOutcome::PowerOff => {
                self.controller.request_shutdown();
                tracing::info!("shutting down for power-off");
                self.deliver(&Event::core(names::SHUTDOWN));
            }
            RunOutcome::Stopped => tracing::info!("stopping every worker"),
            RunOutcome::Fault(err) => {
                tracing::error!(error = %err, "router state is inconsistent, stopping every worker")
            }
        }

        let deadline = now.checked_add(self.config.shutdown_timeout);
        self.stopping = Some(Stopping { outcome, deadline });
        self.loading = false;
        self.startup_deadline = None;
        let grace = self.terminate_deadline(now);
        for handle in self.registry.handles_mut() {
            handle.request_terminate(grace);
        }
    }

    /// Timer work of one pass. Returns the outcome once stopping is complete.
    pub fn on_timers(&mut self, now: Instant) -> Option<RunOutcome> {
        self.remove_exited(now);

        if self.stopping.is_none() {
            let fired = ticks::fire_due(&mut self.registry, now);
            if fired > 0 {
                tracing::trace!(fired, "ticks sent");
            }
            self.maybe_finish_loading(now);
            if self.controller.poll(now) {
                tracing::info!("idle timeout elapsed");
                self.begin_stop(RunOutcome::PowerOff, now);
            }
        }

        self.reap(now);

        if let Err(err) = self.registry.verify() {
            self.begin_stop(RunOutcome::Fault(err), now);
        }

        match &self.stopping {
            Some(stopping) if self.registry.is_empty() => Some(stopping.outcome.clone()),
            _ => None,
        }
    }

    /// Force-stop workers whose grace period expired, and everything once the
    /// shutdown bound has passed.
    fn reap(&mut self, now: Instant) {
        let stop_expired = self
            .stopping
            .as_ref()
            .and_then(|stopping| stopping.deadline)
            .is_some_and(|deadline| now >= deadline);
        let overdue: Vec<WorkerId> = self
            .registry
            .handles()
            .filter(|handle| stop_expired || handle.is_overdue(now))
            .map(|handle| handle.id().clone())
            .collect();
        if overdue.is_empty() {
            return;
        }
        for id in overdue {
            if let Some(handle) = self.registry.remove(&id) {
                tracing::warn!(worker = %id, "worker did not exit in time");
                handle.stop();
            }
        }
        self.observe_activity(now);
    }
}

/// Names a mapping must not produce because they describe one worker's own
/// state.
fn is_router_only(name: &str) -> bool {
    matches!(
        name,
        names::REGISTER
            | names::UNREGISTER
            | names::BUSY
            | names::IDLE
            | names::READY
            | names::TICK
            | names::FINISHED_LOADING
    )
}
