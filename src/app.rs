use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::SessionConfig;
use crate::hide;
use crate::linker::Linker;
use crate::local_logger::init_local_logger;
use crate::prelude::*;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Userland shared-object loader and memory-map concealer"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load a shared object with the in-process linker
    Load(LoadArgs),
    /// Rewrite matching file-backed mappings as anonymous memory
    Hide(HideArgs),
    /// Replay an injection session described by a JSON config
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct LoadArgs {
    /// Path to the shared object
    path: PathBuf,

    /// Resolve this exported symbol after loading and print its address
    #[arg(long)]
    symbol: Option<String>,
}

#[derive(Args, Debug)]
struct HideArgs {
    /// Pathname substrings to conceal
    #[arg(required = true)]
    patterns: Vec<String>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to the session config
    #[arg(long)]
    config: PathBuf,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_local_logger()?;

    match cli.command {
        Commands::Load(args) => cmd_load(args),
        Commands::Hide(args) => cmd_hide(args),
        Commands::Run(args) => cmd_run(args),
    }
}

fn cmd_load(args: LoadArgs) -> Result<()> {
    let mut linker = Linker::new();
    linker.load_library(&args.path)?;

    for module in linker.modules() {
        info!(
            "{}: base {:#x}, {:#x} bytes, bias {:#x}",
            module.name(),
            module.base(),
            module.size(),
            module.load_bias()
        );
    }

    if let Some(symbol) = args.symbol {
        match linker.get_symbol(&args.path, &symbol) {
            Some(addr) => info!("{symbol} = {:p}", addr.as_ptr()),
            None => bail!("symbol {symbol} not found in {}", args.path.display()),
        }
    }
    Ok(())
}

fn cmd_hide(args: HideArgs) -> Result<()> {
    hide::hide_all(&args.patterns)
}

fn cmd_run(args: RunArgs) -> Result<()> {
    let config = SessionConfig::load(&args.config)?;

    if config.delay_secs > 0 {
        debug!("waiting {}s before loading", config.delay_secs);
        thread::sleep(Duration::from_secs(config.delay_secs));
    }

    let mut linker = Linker::new();
    for entry in &config.libraries {
        linker.load_library(&entry.path)?;
        if entry.hide {
            if let Some(name) = entry.path.file_name() {
                hide::hide(&name.to_string_lossy())?;
            }
        }
    }

    hide::hide_all(&config.hide_patterns)?;
    info!("session complete, {} libraries loaded", linker.modules().count());
    Ok(())
}
