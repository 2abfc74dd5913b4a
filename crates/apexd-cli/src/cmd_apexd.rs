// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

use std::path::PathBuf;
use std::sync::Arc;

use apexd::{bootstrap, Apexd, Error, LinkMode};
use clap::Parser;

const APEXD_LOG: &str = "APEXD_LOG";

fn main() {
    // because this function exits right away it does not
    // properly handle destruction of data, so we put the actual
    // logic into a separate function/scope
    std::process::exit(main2())
}

fn main2() -> i32 {
    let opt = CmdApexd::parse();
    configure_logging(opt.verbose);

    let config = match apexd::get_config() {
        Err(err) => {
            tracing::error!(err = ?err, "failed to load config");
            return 1;
        }
        Ok(config) => config,
    };

    let result = opt.run(config);
    match result {
        Err(err) => {
            tracing::error!("{err}");
            1
        }
        Ok(code) => code,
    }
}

fn configure_logging(verbosity: usize) {
    use tracing_subscriber::prelude::*;

    let mut config = match verbosity {
        0 => {
            if let Ok(existing) = std::env::var(APEXD_LOG) {
                existing
            } else {
                "apexd=info,warn".to_string()
            }
        }
        1 => "apexd=debug,info".to_string(),
        2 => "apexd=trace,info".to_string(),
        _ => "trace".to_string(),
    };
    std::env::set_var(APEXD_LOG, &config);
    if let Ok(overrides) = std::env::var("RUST_LOG") {
        config.push(',');
        config.push_str(&overrides);
    }
    let env_filter = tracing_subscriber::filter::EnvFilter::from(config);
    let registry = tracing_subscriber::Registry::default().with(env_filter);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(verbosity > 2);
    tracing::subscriber::set_global_default(registry.with(fmt_layer)).unwrap();
}

/// Manages the lifecycle of signed, self-contained system package
/// images: verifies, mounts and activates them, and shepherds staged
/// installation sessions.
#[derive(Debug, Parser)]
#[clap(name = "apexd")]
pub struct CmdApexd {
    /// Make the output more verbose, can be given multiple times
    #[clap(short, long, global = true, parse(from_occurrences))]
    pub verbose: usize,

    /// Without a command the daemon itself is run, as init does.
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the daemon: tear down stale state, bring all packages up,
    /// and stay resident
    #[clap(name = "run")]
    Run,
    /// Verify and install one package into the active directory
    #[clap(name = "stagePackage")]
    StagePackage { package_path: PathBuf },
    /// Verify and install multiple packages into the active directory
    #[clap(name = "stagePackages")]
    StagePackages {
        #[clap(required = true)]
        package_paths: Vec<PathBuf>,
    },
    /// Print the list of active packages
    #[clap(name = "getActivePackages")]
    GetActivePackages,
    /// Mount and activate the package at the given path (debug builds only)
    #[clap(name = "activatePackage")]
    ActivatePackage { package_path: PathBuf },
    /// Deactivate the package at the given path (debug builds only)
    #[clap(name = "deactivatePackage")]
    DeactivatePackage { package_path: PathBuf },
    /// Verify a submitted session and record it for the next boot
    #[clap(name = "submitStagedSession")]
    SubmitStagedSession {
        session_id: u32,
        child_session_ids: Vec<u32>,
    },
    /// Accept a verified session for activation on the next boot
    #[clap(name = "markStagedSessionReady")]
    MarkStagedSessionReady { session_id: u32 },
}

impl CmdApexd {
    fn run(&self, config: Arc<apexd::Config>) -> apexd::Result<i32> {
        let daemon = Apexd::new(config.clone());
        match self.command.as_ref().unwrap_or(&Command::Run) {
            Command::Run => run_daemon(&daemon),
            Command::StagePackage { package_path } => {
                daemon.stage_packages(&[package_path.clone()], LinkMode::Link)?;
                Ok(0)
            }
            Command::StagePackages { package_paths } => {
                daemon.stage_packages(package_paths, LinkMode::Link)?;
                Ok(0)
            }
            Command::GetActivePackages => {
                for info in daemon.get_active_packages() {
                    println!(
                        "Package: {} Version: {} Path: {}",
                        info.name,
                        info.version,
                        info.path.display()
                    );
                }
                Ok(0)
            }
            Command::ActivatePackage { package_path } => {
                debug_check(&config, "activatePackage")?;
                daemon.activate_package(package_path)?;
                Ok(0)
            }
            Command::DeactivatePackage { package_path } => {
                debug_check(&config, "deactivatePackage")?;
                daemon.deactivate_package(package_path)?;
                Ok(0)
            }
            Command::SubmitStagedSession {
                session_id,
                child_session_ids,
            } => {
                let verified = daemon.submit_staged_session(*session_id, child_session_ids)?;
                for apex in verified {
                    println!(
                        "Package: {} Version: {} Path: {}",
                        apex.manifest().name,
                        apex.manifest().version,
                        apex.path().display()
                    );
                }
                Ok(0)
            }
            Command::MarkStagedSessionReady { session_id } => {
                daemon.mark_staged_session_ready(*session_id)?;
                Ok(0)
            }
        }
    }
}

/// The direct activation surface bypasses staging and is only meant
/// for development images.
fn debug_check(config: &apexd::Config, operation: &str) -> apexd::Result<()> {
    if config.debug {
        return Ok(());
    }
    Err(Error::new_errno(
        libc::EACCES,
        format!("{operation} is only available on debug builds"),
    ))
}

fn run_daemon(daemon: &Apexd) -> apexd::Result<i32> {
    bootstrap::run(daemon)?;

    // the mounts live in the shared namespace; all that is left is to
    // stay resident until asked to stop
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| Error::wrap_io(err, "Failed to establish async runtime"))?;
    rt.block_on(async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = interrupt.recv() => tracing::info!("interrupt received, shutting down"),
            _ = terminate.recv() => tracing::info!("terminate signal received, shutting down"),
        };
        Ok::<_, std::io::Error>(())
    })
    .map_err(|err| Error::wrap_io(err, "Failed to wait for shutdown signal"))?;
    Ok(0)
}
