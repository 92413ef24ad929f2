#![cfg_attr(feature = "strict", deny(warnings))]

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{info, warn};

mod feature;
mod libs;

use feature::{
    aws::current_region,
    emitter::{configure_env_vars, emitter_from_config},
    release::{ReleaseOptions, ReleaseOutcome},
    scanner::{connect_clients, shutdown_signal, Scanner},
};
use libs::{
    config::{process_env, Config},
    release::ReleaseConfig,
};

const DEFAULT_RELEASE_CONFIG: &str = ".releaserc.json";

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args
{
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command
{
    /// Export ECS service events until interrupted (the default).
    Run,

    /// Work out the next version from the commit history and publish it.
    Release
    {
        #[arg(short, long, default_value = DEFAULT_RELEASE_CONFIG)]
        config: PathBuf,

        #[arg(short, long, default_value = ".")]
        repository: PathBuf,

        /// Analyze and render everything, but publish nothing.
        #[arg(long, action)]
        dry_run: bool,
    },

    /// Check the release configuration and report every problem.
    VerifyReleaseConfig
    {
        #[arg(short, long, default_value = DEFAULT_RELEASE_CONFIG)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()>
{
    // Initialize the logger, while in debug mode, log everything; otherwise, log only errors, warnings and info.
    // RUST_LOG still wins over either.
    let level = if cfg!(debug_assertions) { log::LevelFilter::max() } else { log::LevelFilter::Info };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    // Parse the command line arguments
    let args = Args::parse();

    match args.command.unwrap_or(Command::Run)
    {
        Command::Run => run_exporter().await,
        Command::Release { config, repository, dry_run } => run_release(config, repository, dry_run).await,
        Command::VerifyReleaseConfig { config } => verify_release_config(config),
    }
}

async fn run_exporter() -> anyhow::Result<()>
{
    let mut config = Config::load(&process_env).context("failed to load config")?;
    configure_env_vars(&mut config, &process_env);

    let default_region = if config.regions.is_empty() { current_region().await } else { None };
    config.apply_defaults(default_region).context("invalid config")?;

    let emitter = emitter_from_config(&config.logging.logger, &config.logging.options)
        .context("failed to configure emitter")?;
    let clients = connect_clients(&config).await;
    let scanner = Scanner::new(&config, clients, emitter)?;

    info!(
        "Scanning every {}s with the {} emitter across {} region(s) and {} role(s)",
        config.scan_interval,
        config.logging.logger,
        config.regions.len(),
        config.roles.len()
    );
    scanner.run(shutdown_signal()).await;
    Ok(())
}

async fn run_release(config: PathBuf, repository: PathBuf, dry_run: bool) -> anyhow::Result<()>
{
    let release_config = ReleaseConfig::load(&config)
        .with_context(|| format!("failed to load release config {}", config.display()))?;
    let options = ReleaseOptions { repository, dry_run };

    match feature::release::run(&release_config, &options, &process_env).await?
    {
        None => info!("No release published"),
        Some(ReleaseOutcome { previous_tag, next_release, url }) =>
        {
            info!("Next release {} follows {}", next_release.git_tag(), previous_tag.as_deref().unwrap_or("no previous release"));
            match url
            {
                Some(url) => info!("Published release {}: {}", next_release.git_tag(), url),
                None if dry_run => info!("Release {} was not published (dry run)", next_release.git_tag()),
                None => warn!("Release {} has no publisher configured", next_release.git_tag()),
            }
            if dry_run
            {
                println!("{}", next_release.notes);
            }
        }
    }
    Ok(())
}

fn verify_release_config(config: PathBuf) -> anyhow::Result<()>
{
    let release_config = ReleaseConfig::load(&config)
        .with_context(|| format!("failed to load release config {}", config.display()))?;
    release_config.validate()?;
    info!("{} is valid", config.display());
    Ok(())
}
