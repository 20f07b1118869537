// ============================================================================
// collectd: command-line entry point
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tracing::info;

use collectd_rt::adapters::module_names;
use collectd_rt::config::{plugin_block_name, DaemonConfig};
use collectd_rt::daemon::{Daemon, VERSION};
use collectd_rt::error::{CollectdError, ConfigError, EXIT_CONFIG_ERROR, EXIT_RUNTIME_ERROR};
use collectd_rt::logging::init_logging;
use collectd_rt::plugin::LogSinks;
use collectd_rt::types::DataSetRegistry;

// ----------------------------------------------------------------------------
// 1.1 Command Line
// ----------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "collectd",
    version,
    about = "System statistics collection daemon",
    long_about = "collectd gathers statistics through read plugins, keeps the latest \
                  values in a cache, derives aggregates and hands every sample to the \
                  configured write plugins."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short = 'C', long, default_value = "collectd.toml", env = "COLLECTD_CONFIG")]
    pub config: PathBuf,

    /// Log level override (err, warning, notice, info, debug)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Test the configuration and exit
    #[arg(short, long)]
    pub test: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the daemon (default)
    Run,

    /// Validate the configuration file
    Validate {
        /// Print the parsed plugin blocks
        #[arg(short, long)]
        verbose: bool,
    },

    /// Write a default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and built-in plugins
    Version,

    /// List known data sets
    Types,
}

// ----------------------------------------------------------------------------
// 1.2 Handlers
// ----------------------------------------------------------------------------

fn load_config(path: &Path) -> AnyhowResult<DaemonConfig> {
    DaemonConfig::load(path).with_context(|| format!("Failed to load configuration from {}", path.display()))
}

fn handle_validate(path: &Path, verbose: bool) -> AnyhowResult<()> {
    let config = load_config(path)?;
    println!("Configuration {} is valid", path.display());
    println!("  Interval:     {}", config.interval);
    println!("  Timeout:      {} intervals", config.timeout_factor);
    println!("  ReadThreads:  {}", config.read_threads);
    println!("  Hostname:     {}", config.settings().hostname);
    println!("  TypesDB:      {} file(s)", config.types_db.len());
    println!(
        "  Plugins:      {}",
        config.load_plugins.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(", ")
    );
    if verbose {
        for block in &config.plugin_blocks {
            println!("\n[Plugin {}]", plugin_block_name(block).unwrap_or("?"));
            println!("{:#?}", block.children);
        }
    }
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let content = DaemonConfig::generate_default();
    match output {
        Some(path) => {
            fs::write(path, &content).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Default configuration written to {}", path.display());
        }
        None => print!("{}", content),
    }
    Ok(())
}

fn handle_version() {
    println!("collectd {}", VERSION);
    println!("  Target:   {}-{}", std::env::consts::ARCH, std::env::consts::OS);
    println!("  Plugins:  {}", module_names().join(", "));
}

fn handle_types(path: &Path) -> AnyhowResult<()> {
    let registry = DataSetRegistry::with_builtin_types();
    if path.exists() {
        let config = load_config(path)?;
        for db in &config.types_db {
            registry
                .load_types_db(db)
                .with_context(|| format!("Failed to load types database {}", db.display()))?;
        }
    }
    let mut data_sets = registry.all();
    data_sets.sort_by(|a, b| a.type_name.cmp(&b.type_name));
    for ds in data_sets {
        println!("{}", ds);
    }
    Ok(())
}

async fn handle_run(cli: &Cli) -> AnyhowResult<()> {
    let config = load_config(&cli.config)?;

    let mut logging = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging.level = level.clone();
    }
    let sinks = LogSinks::new();
    let _guard = init_logging(&logging, sinks.clone()).context("Failed to initialize logging")?;

    info!("collectd {} starting", VERSION);
    let daemon = Daemon::with_log_sinks(config, sinks).context("Startup failed")?;
    daemon.run().await?;
    Ok(())
}

/// Exit status for an error that ended the process.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(err) = err.downcast_ref::<CollectdError>() {
        return err.exit_code();
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return EXIT_CONFIG_ERROR;
    }
    EXIT_RUNTIME_ERROR
}

// ----------------------------------------------------------------------------
// 1.3 Main
// ----------------------------------------------------------------------------

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    let result = if cli.test {
        load_config(&cli.config)
            .and_then(|config| Daemon::new(config).map(|_| ()).context("Plugin configuration failed"))
            .map(|()| println!("Configuration {} OK", cli.config.display()))
    } else {
        match &cli.command {
            Some(Commands::Validate { verbose }) => handle_validate(&cli.config, *verbose),
            Some(Commands::GenerateConfig { output }) => handle_generate_config(output.as_deref()),
            Some(Commands::Version) => {
                handle_version();
                Ok(())
            }
            Some(Commands::Types) => handle_types(&cli.config),
            Some(Commands::Run) | None => handle_run(&cli).await,
        }
    };

    if let Err(err) = result {
        eprintln!("Error: {:#}", err);
        std::process::exit(exit_code_for(&err));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_exit_codes() {
        let config: anyhow::Error = ConfigError::missing_field("Interval").into();
        assert_eq!(exit_code_for(&config), EXIT_CONFIG_ERROR);

        let wrapped = anyhow::Error::new(CollectdError::out_of_memory("startup")).context("Startup failed");
        assert_eq!(exit_code_for(&wrapped), collectd_rt::error::EXIT_OUT_OF_MEMORY);

        assert_eq!(exit_code_for(&anyhow::anyhow!("boom")), EXIT_RUNTIME_ERROR);
    }

    #[test]
    fn test_default_subcommand_is_run() {
        let cli = Cli::parse_from(["collectd", "-C", "/etc/collectd.toml"]);
        assert!(cli.command.is_none());
        assert!(!cli.test);
        let cli = Cli::parse_from(["collectd", "validate", "--verbose"]);
        assert!(matches!(cli.command, Some(Commands::Validate { verbose: true })));
    }
}
