//! abot - a plugin-driven assistant
//!
//! Runs the router, installs plugins and talks to a running router.

use abot::config::{load_config, AppConfig};
use abot::console::{Console, RustylineSource};
use abot::installer::PluginInstaller;
use abot::message::FlexIdType;
use abot::onboard::Onboard;
use abot::server::Server;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "abot")]
#[command(author, version, about = "Plugin-driven assistant")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the abot router
    #[command(alias = "s")]
    Server {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
    },

    /// Manage plugins
    #[command(alias = "p")]
    Plugin {
        #[command(subcommand)]
        action: PluginCommands,
    },

    /// Send commands to a running router: `abot console [addr] <flex-id>`
    #[command(alias = "c")]
    Console {
        /// Router address, or the flex ID when no address is given
        first: String,

        /// Flex ID (phone number or email)
        second: Option<String>,

        /// Flex ID type: 1 = email, 2 = phone (overrides config)
        #[arg(long)]
        flexidtype: Option<u8>,
    },

    /// Run the onboard package as its own process
    Onboard {
        /// Port the package listens on (0 picks a free one)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Router to register with (defaults to the local router)
        #[arg(long)]
        router: Option<String>,
    },
}

#[derive(Subcommand)]
enum PluginCommands {
    /// Fetch, pin and install the plugins listed in the manifest
    Install {
        /// Manifest to install from (overrides config)
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config()?;

    // Initialize logging
    let filter = if cli.verbose || config.debug {
        "abot=debug,tower_http=debug"
    } else {
        "abot=info,tower_http=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Server { port, host } => cmd_server(config, port, host).await,
        Commands::Plugin {
            action: PluginCommands::Install { manifest },
        } => cmd_install(config, manifest).await,
        Commands::Console {
            first,
            second,
            flexidtype,
        } => cmd_console(config, first, second, flexidtype).await,
        Commands::Onboard { port, router } => cmd_onboard(config, port, router).await,
    }
}

/// Start the router and stop it cleanly on Ctrl-C
async fn cmd_server(
    mut config: AppConfig,
    port: Option<u16>,
    host: Option<String>,
) -> anyhow::Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    Server::new(config).await?.run_until(shutdown_rx).await
}

/// Install plugins; on failure print the collected tool output, then the error
async fn cmd_install(mut config: AppConfig, manifest: Option<PathBuf>) -> anyhow::Result<()> {
    if let Some(manifest) = manifest {
        config.installer.manifest_path = manifest;
    }

    let installer = PluginInstaller::from_config(&config.installer)?;
    match installer.install_from(&config.installer.manifest_path).await {
        Ok(summary) => {
            for (path, revision) in &summary.pinned {
                info!(path = %path, revision = %revision, "Pinned");
            }
            for skipped in &summary.skipped {
                error!(path = %skipped.path(), error = %skipped, "Not pinned");
            }
            Ok(())
        }
        Err(e) => {
            if let Some(output) = e.command_output() {
                eprintln!("{}", output.trim_end());
            }
            Err(e.into())
        }
    }
}

async fn cmd_console(
    config: AppConfig,
    first: String,
    second: Option<String>,
    flexidtype: Option<u8>,
) -> anyhow::Result<()> {
    let (addr, flex_id) = match second {
        Some(flex_id) => (first, flex_id),
        None => (format!("localhost:{}", config.server.port), first),
    };
    let flex_id_type = match flexidtype {
        Some(code) => FlexIdType::try_from(code).map_err(anyhow::Error::msg)?,
        None => config.console.flex_id_type,
    };

    let console = Console::new(&addr, flex_id_type, flex_id)?;
    console.probe().await?;

    // Ctrl-C while a command is in flight still ends with a newline
    let interrupt = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    let mut source = RustylineSource::new()?;
    let mut stdout = std::io::stdout();
    console.run_until(&mut source, &mut stdout, interrupt).await?;
    Ok(())
}

async fn cmd_onboard(config: AppConfig, port: u16, router: Option<String>) -> anyhow::Result<()> {
    let router = router.unwrap_or_else(|| format!("http://localhost:{}", config.server.port));
    let onboard = Onboard::new(config.server.public_base_url());
    onboard.serve(port, &router).await?;
    Ok(())
}
