//! Supervisor of the jukebox event bus.
//!
//! The [`Router`] spawns one isolated worker per plugin, translates the raw
//! events they emit through the [`EventMap`], fans the results out to
//! subscribers, sends periodic ticks and powers the box off once every
//! worker has been idle for long enough.
//!
//! ```rust,ignore
//! let eventmap = EventMap::load(&config.user_eventmap_path(&dirs))?;
//! let mut router = Router::new(RouterConfig::from(&config.core), eventmap);
//! router.spawn_all(
//!     config
//!         .enabled_plugins()
//!         .map(|(name, descriptor)| WorkerSpec::from_descriptor(name, descriptor)),
//! );
//! match router.run() {
//!     RunOutcome::PowerOff => power_off(),
//!     RunOutcome::Stopped => {}
//!     RunOutcome::Fault(err) => return Err(err.into()),
//! }
//! ```

pub mod error;
pub mod eventmap;
pub mod idle;
pub mod registry;
pub mod router;
pub mod ticks;
pub mod worker;

pub use error::BusError;
pub use eventmap::{EventMap, EventMapError, MappingError, Output, Pattern, Rule, BUILTIN_RULES};
pub use idle::{ControllerState, IdleController, Transition};
pub use registry::{parse_subscription, Registry, RegistryError, SubscriptionError};
pub use router::{InterruptHandle, Router, RouterConfig, RunOutcome};
pub use ticks::TickSchedule;
pub use worker::{Activity, Phase, WorkerHandle, WorkerSpec};
