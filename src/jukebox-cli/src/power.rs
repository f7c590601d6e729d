use jukebox_core::CoreConfig;
use std::process::{Command, ExitStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PowerOffError {
    #[error("core.shutdown_command is empty")]
    EmptyCommand,
    #[error("failed to run '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("'{program}' exited with {status}")]
    Failed { program: String, status: ExitStatus },
}

/// The configured shutdown command followed by the delay in minutes,
/// e.g. `sudo shutdown -P 1`.
pub fn command_line(core: &CoreConfig) -> Result<Vec<String>, PowerOffError> {
    if core.shutdown_command.first().map_or(true, |program| program.is_empty()) {
        return Err(PowerOffError::EmptyCommand);
    }
    let mut argv = core.shutdown_command.clone();
    argv.push(core.shutdown_delay_minutes.to_string());
    Ok(argv)
}

/// Ask the host to power off. Does nothing in debug mode.
pub fn power_off(core: &CoreConfig) -> Result<(), PowerOffError> {
    let argv = command_line(core)?;
    if core.debug {
        tracing::info!(command = %argv.join(" "), "debug mode, not powering off");
        return Ok(());
    }

    let (program, args) = argv.split_first().ok_or(PowerOffError::EmptyCommand)?;
    tracing::info!(command = %argv.join(" "), "powering off");
    let status = Command::new(program)
        .args(args)
        .status()
        .map_err(|source| PowerOffError::Spawn {
            program: program.clone(),
            source,
        })?;
    if !status.success() {
        return Err(PowerOffError::Failed {
            program: program.clone(),
            status,
        });
    }
    Ok(())
}
