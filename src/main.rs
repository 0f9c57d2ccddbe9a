use std::io::{self, BufRead};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, info_span, warn};
use tracing_subscriber::EnvFilter;

use jitreg::{lock_global, DebugInfoInstaller, SymbolFile};

/// Registers object files with an attached debugger through the JIT interface.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Wait for Enter before unregistering, so a debugger can inspect the list.
    #[arg(long, env = "JITREG_WAIT")]
    wait: bool,

    /// Symbol files (usually ELF objects) to register.
    #[arg(required = true)]
    symfiles: Vec<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let installer = DebugInfoInstaller::from_env();
    if !installer.is_enabled() {
        warn!("debugger registration is disabled, nothing to do");
        return Ok(());
    }

    let mut registrations = Vec::with_capacity(args.symfiles.len());
    for path in &args.symfiles {
        let _span = info_span!("symfile", path = %path.display()).entered();
        let symfile = SymbolFile::map(path).with_context(|| format!("loading {path:?}"))?;
        let Some(mut registration) = installer.install(symfile) else {
            continue;
        };
        registration
            .activate()
            .with_context(|| format!("registering {path:?}"))?;
        info!("{registration}");
        registrations.push(registration);
    }

    {
        let registry = lock_global();
        info!("{} code entries registered", registry.len());
        for entry in registry.iter() {
            info!(
                "  {}: {:?} ({} bytes)",
                entry.handle, entry.symfile_addr, entry.symfile_size
            );
        }
    }

    if args.wait {
        info!("pid {}: press Enter to unregister", std::process::id());
        io::stdin()
            .lock()
            .lines()
            .next()
            .transpose()
            .context("reading stdin")?;
    }

    while let Some(mut registration) = registrations.pop() {
        registration.release().context("unregistering")?;
    }
    info!("all code entries unregistered");

    Ok(())
}
