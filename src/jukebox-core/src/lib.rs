pub mod config;
pub mod event;
pub mod logging;
pub mod paths;

pub use config::{
    Config, ConfigError, CoreConfig, EventMapConfig, LogLevel, LoggingConfig, OverrideError,
    PluginDescriptor, ValidationError,
};
pub use event::{names, Event, Origin, Payload, PayloadValue, WorkerId};
pub use logging::{init_logging, LoggingError, LoggingGuard};
pub use paths::{AppDirs, DirsError};

pub const APP_NAME: &str = "jukebox";
pub const APP_AUTHOR: &str = "Jukebox";
pub const APP_QUALIFIER: &str = "io";
