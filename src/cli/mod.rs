use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{ConfigLoader, ConfigPaths};
use crate::storage;

pub mod commands;

use self::commands::{AddArgs, CheckUrlArgs, DeleteArgs, ListArgs, Services, TitleArgs, WatchArgs};

#[derive(Parser, Debug)]
#[command(
    name = "linkshelf",
    version,
    about = "Bookmark shelf with live sync across sessions"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Override the config file location (takes precedence over LINKSHELF_CONFIG)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the data directory (takes precedence over LINKSHELF_DATA)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Follow the bookmark list live and edit it from stdin (default)
    Watch(WatchArgs),
    /// Save a bookmark, fetching its title when none is given
    Add(AddArgs),
    /// Delete a bookmark by id
    Delete(DeleteArgs),
    /// Print bookmarks, newest first
    List(ListArgs),
    /// Check whether an address would be accepted
    CheckUrl(CheckUrlArgs),
    /// Resolve the title a page would be saved with
    Title(TitleArgs),
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let override_config = cli
        .config
        .clone()
        .or_else(|| env::var_os("LINKSHELF_CONFIG").map(PathBuf::from));
    let override_data = cli
        .data_dir
        .clone()
        .or_else(|| env::var_os("LINKSHELF_DATA").map(PathBuf::from));
    let loader = ConfigLoader::with_paths(ConfigPaths::resolve(override_config, override_data)?);
    loader.paths().ensure_directories()?;
    let paths = loader.paths().clone();
    init_tracing(&cli.log_level)
        .with_context(|| format!("initialising logging at level {}", cli.log_level))?;
    let config = loader.load_or_init()?;
    let storage = storage::init(&paths, &config.storage)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;

    runtime.block_on(async move {
        let services = Services::new(Arc::new(config), storage)?;
        let command = cli
            .command
            .unwrap_or_else(|| Commands::Watch(WatchArgs::default()));
        match command {
            Commands::Watch(args) => commands::watch(&services, args).await,
            Commands::Add(args) => {
                let output = commands::add(&services.storage, services.scraper.clone(), args).await?;
                print!("{output}");
                Ok(())
            }
            Commands::Delete(args) => {
                print!("{}", commands::delete(&services.storage, args).await?);
                Ok(())
            }
            Commands::List(args) => {
                print!("{}", commands::list(&services.storage, args).await?);
                Ok(())
            }
            Commands::CheckUrl(args) => {
                print!("{}", commands::check_url(&args)?);
                Ok(())
            }
            Commands::Title(args) => {
                print!("{}", commands::title(services.titles.clone(), args).await?);
                Ok(())
            }
        }
    })
}

fn init_tracing(level: &str) -> Result<()> {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_try_init(|| {
        let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        Ok(())
    })
    .map(|_| ())
}
