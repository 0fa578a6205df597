//! Passdrop CLI - One-time drop box for text and images
//!
//! Usage:
//!   passdrop serve   - Run the HTTP service until Ctrl+C
//!   passdrop init    - Write a default config file
//!   passdrop config  - Print the effective configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use passdrop::config::{default_config_path, Config, RuntimeMode};
use passdrop::server;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Passdrop - hand over text and images behind a one-time passkey
#[derive(Parser)]
#[command(name = "passdrop")]
#[command(about = "One-time drop box for text and images", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service
    Serve {
        /// Config file (default: ~/.config/passdrop/passdrop.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides config)
        #[arg(short, long, env = "PORT")]
        port: Option<u16>,

        /// Address to bind (overrides config)
        #[arg(short, long)]
        bind: Option<IpAddr>,

        /// Force development mode (enables the admin listing)
        #[arg(long)]
        dev: bool,
    },

    /// Write a default config file
    Init {
        /// Where to write the config
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Print the effective configuration as TOML
    Config {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("passdrop={}", log_level).parse()?),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve {
            config,
            port,
            bind,
            dev,
        } => cmd_serve(config.as_deref(), port, bind, dev),
        Commands::Init { config, force } => cmd_init(config, force),
        Commands::Config { config } => cmd_config(config.as_deref()),
    }
}

// ============ SERVE COMMAND ============

fn cmd_serve(
    config_path: Option<&Path>,
    port: Option<u16>,
    bind: Option<IpAddr>,
    dev: bool,
) -> Result<()> {
    let mut config = Config::load_or_default(config_path)?;
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if dev {
        config.mode = RuntimeMode::Development;
    }

    println!("{}", "Passdrop".bold().cyan());
    println!();
    println!(
        "Blob directory: {}",
        config.storage.blob_dir.display().to_string().dimmed()
    );
    match config.retention.ttl() {
        Some(ttl) => println!("Entries expire after {}s", ttl.as_secs()),
        None => println!("Entries never expire"),
    }
    if config.mode.is_development() {
        println!("{}", "Development mode: /admin/files is enabled".yellow());
    }
    println!();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let handle = server::start(&config).await?;

        println!(
            "{}",
            format!("Listening on http://{}", handle.local_addr())
                .green()
                .bold()
        );
        println!("{}", "Press Ctrl+C to stop.".dimmed());

        tokio::signal::ctrl_c()
            .await
            .context("Cannot listen for Ctrl+C")?;
        println!();
        println!("Shutting down...");
        handle.stop();
        handle.wait().await?;
        println!("{}", "Server stopped.".green());

        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

// ============ INIT COMMAND ============

fn cmd_init(config_path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = config_path.unwrap_or_else(default_config_path);

    if path.exists() && !force {
        println!(
            "{} {}",
            "✗ Config already exists:".red(),
            path.display()
        );
        println!("Use {} to overwrite it.", "--force".cyan());
        return Ok(());
    }

    Config::default().save(&path)?;
    println!(
        "{} {}",
        "✓ Config written to".green(),
        path.display().to_string().bold()
    );

    Ok(())
}

// ============ CONFIG COMMAND ============

fn cmd_config(config_path: Option<&Path>) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    print!("{}", config.to_toml()?);
    Ok(())
}
