mod power;
mod signals;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use jukebox_bus::{EventMap, Router, RouterConfig, RunOutcome, WorkerSpec};
use jukebox_core::{init_logging, AppDirs, Config, LogLevel};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "jukebox", version, about = "Headless jukebox supervisor")]
struct Cli {
    /// Keep config, event map and logs in this directory
    #[arg(short = 'd', long, global = true, value_name = "DIR")]
    user_dir: Option<PathBuf>,
    /// Override a config value, e.g. core.idle_timeout_secs=600 (repeatable,
    /// several may be joined with @@)
    #[arg(short = 'o', long = "option", global = true, value_name = "KEY=VALUE")]
    options: Vec<String>,
    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Never power off; forces at least debug logging
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the plugins and run the event bus (default)
    Run,
    /// Plugin commands
    #[command(subcommand)]
    Plugins(PluginsCommand),
    /// Event map commands
    #[command(subcommand)]
    Eventmap(EventmapCommand),
}

#[derive(Debug, Subcommand)]
enum PluginsCommand {
    /// List configured plugins
    List,
}

#[derive(Debug, Subcommand)]
enum EventmapCommand {
    /// Print the merged rule table in match order
    Show,
}

impl Cli {
    fn dirs(&self) -> Result<AppDirs> {
        match &self.user_dir {
            Some(dir) => Ok(AppDirs::with_user_dir(dir)),
            None => Ok(AppDirs::discover()?),
        }
    }

    /// Config file, then `--option` overrides, then the flags.
    fn load_config(&self, dirs: &AppDirs) -> Result<Config> {
        let mut config = Config::load_or_default(dirs)?
            .with_overrides(self.options.as_slice())
            .context("applying --option overrides")?;
        if self.debug {
            config.core.debug = true;
        }
        if let Some(level) = LogLevel::from_verbosity(self.verbose) {
            config.logging.level = config.logging.level.most_verbose(level);
        }
        if config.core.debug {
            config.logging.level = config.logging.level.most_verbose(LogLevel::Debug);
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = cli.dirs()?;
    let config = cli.load_config(&dirs)?;
    let _logging = init_logging(&config.logging, &dirs)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Plugins(PluginsCommand::List) => print_plugins(&config),
        Command::Eventmap(EventmapCommand::Show) => {
            let eventmap = EventMap::load(&config.user_eventmap_path(&dirs))?;
            print_rules(&eventmap);
        }
        Command::Run => run(&config, &dirs)?,
    }

    Ok(())
}

fn run(config: &Config, dirs: &AppDirs) -> Result<()> {
    let eventmap_path = config.user_eventmap_path(dirs);
    let eventmap = EventMap::load(&eventmap_path)
        .with_context(|| format!("loading event map {}", eventmap_path.display()))?;

    let mut router = Router::new(RouterConfig::from(&config.core), eventmap);
    signals::spawn_signal_bridge(router.interrupt_handle())
        .context("starting the signal handler")?;
    let running = router.spawn_all(
        config
            .enabled_plugins()
            .map(|(name, descriptor)| WorkerSpec::from_descriptor(name, descriptor)),
    );
    tracing::info!(
        running,
        configured = config.plugins.len(),
        debug = config.core.debug,
        config_dir = %dirs.config_dir().display(),
        "jukebox starting"
    );

    match router.run() {
        RunOutcome::Stopped => {
            tracing::info!("jukebox stopped");
            Ok(())
        }
        RunOutcome::PowerOff => {
            power::power_off(&config.core).context("powering off the host")?;
            Ok(())
        }
        RunOutcome::Fault(err) => {
            Err(err).context("event bus stopped after an internal fault")
        }
    }
}

fn print_plugins(config: &Config) {
    if config.plugins.is_empty() {
        println!("No plugins configured. Add [plugins.<name>] sections to config.toml.");
        return;
    }

    for (name, plugin) in &config.plugins {
        let marker = if plugin.enabled { "" } else { " (disabled)" };
        println!("Plugin: {name}{marker}");
        println!("  executable: {}", plugin.executable.display());
        if !plugin.args.is_empty() {
            println!("  args: {}", plugin.args.join(" "));
        }
        match plugin.tick_interval_ms {
            Some(ms) => println!("  tick: every {ms} ms"),
            None => println!("  tick: (none)"),
        }
    }
}

fn print_rules(eventmap: &EventMap) {
    if eventmap.rules().is_empty() {
        println!("No rules; every event passes through unchanged.");
        return;
    }
    for (position, rule) in eventmap.rules().iter().enumerate() {
        println!("{:>3}. {rule}", position + 1);
    }
}
