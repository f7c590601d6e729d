//! Bridges OS termination signals into the router's inbound queue.
//!
//! On Unix SIGINT, SIGTERM and SIGQUIT are handled; elsewhere only Ctrl-C.
//! Handlers are registered before [`spawn_signal_bridge`] returns, so a
//! signal arriving while plugins are still starting stops them cleanly
//! instead of killing the supervisor.

use jukebox_bus::InterruptHandle;
use std::io;
use std::thread;

#[cfg(unix)]
struct ShutdownSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    /// Must be called inside a runtime context.
    fn install() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.quit.recv() => "SIGQUIT",
        }
    }
}

#[cfg(not(unix))]
struct ShutdownSignals {
    ctrl_c: tokio::signal::windows::CtrlC,
}

#[cfg(not(unix))]
impl ShutdownSignals {
    fn install() -> io::Result<Self> {
        Ok(Self {
            ctrl_c: tokio::signal::windows::ctrl_c()?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        self.ctrl_c.recv().await;
        "ctrl-c"
    }
}

/// Register the signal handlers now, then wait for a signal on a background
/// thread and interrupt the router when one arrives.
pub fn spawn_signal_bridge(interrupt: InterruptHandle) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let mut signals = {
        let _context = runtime.enter();
        ShutdownSignals::install()?
    };

    thread::Builder::new().name("signals".into()).spawn(move || {
        let signal = runtime.block_on(signals.recv());
        tracing::info!(signal, "termination signal received");
        interrupt.interrupt(signal);
    })?;
    Ok(())
}
