use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use wirekit::{
    property_map_from_json, ComponentRuntime, ConfigSource, MemoryConfigSource, ServiceRegistry,
};
use wirekit_bootstrap::{init_logging, wait_for_shutdown, AppConfig};

mod demo;

/// WireKit host - declarative component runtime
#[derive(Parser)]
#[command(name = "wirekit-host")]
#[command(about = "WireKit host - declarative component runtime")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the host
    Run,
    /// Validate configuration and component metadata, then exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if cli.verbose > 0 {
        let level = if cli.verbose == 1 { "debug" } else { "trace" };
        config
            .logging
            .entry("default".to_string())
            .or_default()
            .console_level = level.to_string();
    }

    if cli.print_config {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Check => {
            demo::clock_metadata()?;
            demo::greeter_metadata()?;
            println!("configuration OK");
            Ok(())
        }
        Commands::Run => run(config).await,
    }
}

async fn run(config: AppConfig) -> Result<()> {
    init_logging(&config.logging, &config.logs_dir);

    let registry = Arc::new(ServiceRegistry::new());
    let source = Arc::new(MemoryConfigSource::new());
    let runtime = ComponentRuntime::new(
        Arc::clone(&registry),
        Arc::clone(&source) as Arc<dyn ConfigSource>,
    );

    // seed component configuration before anything activates
    for (key, value) in &config.components {
        let (pid, instance) = AppConfig::split_pid(key);
        let properties = property_map_from_json(value);
        match instance {
            Some(instance) => source.put_factory(pid, instance, properties),
            None => source.put(pid, properties),
        }
    }

    demo::register(&runtime).await?;
    for description in runtime.descriptions() {
        tracing::debug!(
            component = %description.name,
            state = ?description.instances.first().map(|i| i.state),
            "component registered"
        );
    }
    tracing::info!("wirekit host started");

    wait_for_shutdown().await?;

    runtime.dispose_all();
    tracing::info!("wirekit host stopped");
    Ok(())
}
