use blockfs::{
    fs::{Config, LookupScope},
    shell, Volume,
};
use clap::{Parser, Subcommand};
use eyre::{Context, Result};
use std::io;
use std::path::PathBuf;
use tracing::trace;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(version, about = "Simulated block file system")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the interactive shell, saving the snapshot on exit
    Shell {
        #[arg(index = 1, default_value = "fs.snapshot")]
        snapshot: PathBuf,
        /// Only look up directories among the children of the current one
        #[arg(long)]
        strict_lookup: bool,
        /// Geometry used when the snapshot has to be created
        #[arg(short = 'c', long, default_value_t = Config::DEFAULT_BLOCK_COUNT)]
        block_count: usize,
        #[arg(short = 's', long, default_value_t = Config::DEFAULT_BLOCK_SIZE)]
        block_size: usize,
    },
    /// Write an empty snapshot
    Create {
        #[arg(index = 1)]
        target: PathBuf,
        #[arg(short = 'c', long, default_value_t = Config::DEFAULT_BLOCK_COUNT)]
        block_count: usize,
        #[arg(short = 's', long, default_value_t = Config::DEFAULT_BLOCK_SIZE)]
        block_size: usize,
    },
    /// Print geometry and usage of a snapshot
    Info {
        #[arg(index = 1)]
        snapshot: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::from_default_env())
        .init();
    trace!("Starting up blockfs cli");
    match cli.command {
        Command::Shell {
            snapshot,
            strict_lookup,
            block_count,
            block_size,
        } => {
            let lookup = if strict_lookup {
                LookupScope::Local
            } else {
                LookupScope::Global
            };
            let config = Config {
                block_size,
                block_count,
                lookup,
            };
            let mut volume = Volume::open_or_format(&snapshot, config)?;
            shell::run(volume.fs_mut(), io::stdin().lock(), io::stdout())?;
            volume.sync().wrap_err("Failed to save snapshot")?;
        }
        Command::Create {
            target,
            block_count,
            block_size,
        } => {
            let config = Config {
                block_size,
                block_count,
                ..Config::default()
            };
            Volume::create(target, config).wrap_err("Failed to create snapshot")?;
        }
        Command::Info { snapshot } => {
            let volume = Volume::open(&snapshot, LookupScope::default())?;
            let fs = volume.fs();
            let (total, used) = fs.space_usage();
            println!("snapshot:     {:?}", volume.path());
            println!("block size:   {}", fs.store().block_size());
            println!("block count:  {}", fs.store().block_count());
            println!("free blocks:  {}", fs.store().free_count());
            println!("total bytes:  {total}");
            println!("used bytes:   {used}");
            println!("directories:  {}", fs.tree().directories().count());
        }
    }
    Ok(())
}
