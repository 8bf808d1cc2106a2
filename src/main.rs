//! Extension Host - command line front end
//!
//! Lists the plugins of a registry and runs single plugin methods in the
//! sandboxed execution runtime.

use extension_host::core::{Config, ConfigArgs, Logger};
use extension_host::plugin::PluginManager;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "extension-host", version, about = "Run registry-published JavaScript plugins in a sandbox")]
struct Cli {
    #[command(flatten)]
    args: ConfigArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the validated manifests of the registry as JSON
    List,
    /// Invoke a plugin method and print its result
    Call {
        /// Plugin id from the registry
        id: String,
        /// Method to invoke on the plugin instance
        method: String,
        /// Arguments; each is parsed as JSON, falling back to a plain string
        args: Vec<String>,
    },
    /// Measure the round trip to the execution runtime
    Ping,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match Config::load(&cli.args) {
        Ok(cfg) => cfg,
        Err(e) => {
            // Print error to stderr since logging isn't initialized yet
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let _logger = match Logger::init(&config.logging) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return Err(e);
        }
    };

    info!("Starting Extension Host v{}", extension_host::VERSION);
    info!(
        registry = %config.registry.url,
        branch = ?config.registry.branch,
        cache_dir = ?config.loader.cache_dir,
        "Host configuration"
    );

    let manager = PluginManager::from_config(&config)?;

    match cli.command {
        Command::List => {
            let manifests = manager.list_plugins().await?;
            println!("{}", serde_json::to_string_pretty(&manifests)?);
        }
        Command::Call { id, method, args } => {
            let args = args.iter().map(|arg| parse_arg(arg)).collect();
            let result = manager.call(&id, &method, args).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Ping => {
            manager.wait_ready().await?;
            let latency = manager.ping().await?;
            println!("pong in {:?}", latency);
        }
    }

    Ok(())
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
