//! Worker channels for the jukebox event bus.
//!
//! This crate provides:
//! - A JSON-lines protocol ([`Frame`]) for events crossing a worker channel
//! - A host that spawns each plugin as an isolated worker (an OS process, or a
//!   dedicated thread for plugins compiled into the supervisor) and pumps its
//!   frames into the router's shared inbound queue
//! - The plugin side: the [`Plugin`] trait, [`PluginContext`] and
//!   [`serve_stdio`] for writing plugin executables in Rust
//!
//! # Plugin Protocol
//!
//! The supervisor writes one frame per line to the plugin's stdin; the plugin
//! writes one frame per line to its stdout. Stderr is inherited.
//!
//! ```text
//! on start:
//!     write {"name":"register","payload":{"events":["load_source"]}}
//!     write {"name":"ready"}
//!     write {"name":"idle"}
//! while (line = read_stdin()):
//!     frame = json_parse(line)
//!     if frame.name == "terminate":
//!         cleanup(); exit(0)
//!     elif frame.name == "tick":
//!         poll_hardware()
//!     else:
//!         handle(frame)
//! ```

pub mod host;
pub mod protocol;
mod sdk;

pub use host::{
    spawn, ChannelError, ExecConfig, Execution, Inbound, Launch, PluginFactory, SpawnError,
    SpawnedWorker, StopOutcome, WorkerChannel,
};
pub use protocol::{Frame, FrameError, PROTOCOL_VERSION, PROTOCOL_VERSION_FIELD, WORKER_ID_ENV};
pub use sdk::{
    run_plugin, serve_stdio, ChannelSink, FrameSink, Plugin, PluginContext, PluginIoError,
    StdoutSink,
};
