use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mining_session::backend::{create_backend, BackendKind};
use mining_session::config::AppConfig;
use mining_session::logging;
use mining_session::progress::MetricsDisplay;
use mining_session::provision::{CancelToken, ProvisionState};
use mining_session::render::ConfigGenerator;
use mining_session::server::{self, ServerDefaults};
use mining_session::session::MiningHost;

/// Mining Session - provision, configure and monitor CPU mining workers
#[derive(Parser, Debug)]
#[command(name = "mining-session")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/mining-session/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision, configure and run a worker until Ctrl+C
    Run {
        #[command(flatten)]
        profile: ProfileArgs,

        /// Restart a crashed worker up to this many times
        #[arg(long)]
        max_restarts: Option<u32>,

        /// Simulator run time in seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Start with an empty session log
        #[arg(long)]
        truncate_log: bool,
    },

    /// Download and unpack a backend without running it
    Provision {
        /// Backend to provision
        #[arg(short, long)]
        backend: Option<BackendKind>,

        /// Install root override
        #[arg(long)]
        install_root: Option<PathBuf>,
    },

    /// Show provisioning status of every backend
    Status {
        /// Install root override
        #[arg(long)]
        install_root: Option<PathBuf>,
    },

    /// Print the configuration a backend would receive
    Render {
        #[command(flatten)]
        profile: ProfileArgs,

        /// Also write it to the install directory
        #[arg(long)]
        write: bool,
    },

    /// Run as WebSocket server for a host application
    Serve {
        #[command(flatten)]
        profile: ProfileArgs,

        /// Port for WebSocket server
        #[arg(long, default_value = "9876")]
        port: u16,
    },
}

/// Overrides for the configured mining profile
#[derive(Args, Debug, Default)]
struct ProfileArgs {
    /// Worker backend
    #[arg(short, long)]
    backend: Option<BackendKind>,

    /// Pool address (host:port)
    #[arg(long)]
    pool: Option<String>,

    /// Wallet address
    #[arg(long)]
    wallet: Option<String>,

    /// Worker / rig name
    #[arg(long)]
    worker: Option<String>,

    /// Algorithm identifier
    #[arg(long)]
    algorithm: Option<String>,

    /// Number of CPU threads (default: all cores)
    #[arg(short, long)]
    threads: Option<usize>,

    /// CPU usage cap in percent
    #[arg(long)]
    max_cpu: Option<u8>,

    /// Install root override
    #[arg(long)]
    install_root: Option<PathBuf>,
}

impl ProfileArgs {
    /// Apply command line overrides; returns the selected backend
    fn apply(self, config: &mut AppConfig) -> BackendKind {
        let profile = &mut config.profile;
        if let Some(pool) = self.pool {
            profile.pool = pool;
        }
        if let Some(wallet) = self.wallet {
            profile.wallet = wallet;
        }
        if let Some(worker) = self.worker {
            profile.worker = worker;
        }
        if let Some(algorithm) = self.algorithm {
            profile.algorithm = algorithm;
        }
        if let Some(threads) = self.threads {
            profile.threads = threads;
        }
        if let Some(cap) = self.max_cpu {
            profile.max_cpu_usage = cap;
        }
        if let Some(root) = self.install_root {
            config.install_root = root;
        }
        self.backend.unwrap_or(config.backend)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(logging::level_for(cli.verbose, cli.quiet));

    let mut config = AppConfig::load(cli.config.as_deref()).context("Failed to load config")?;

    match cli.command {
        Command::Run {
            profile,
            max_restarts,
            duration,
            truncate_log,
        } => {
            let backend = profile.apply(&mut config);
            if let Some(max_restarts) = max_restarts {
                config.session.max_restarts = max_restarts;
            }
            if let Some(duration) = duration {
                config.simulator.duration_secs = duration;
            }
            config.session.truncate_log |= truncate_log;
            tokio::task::spawn_blocking(move || run_session(config, backend)).await?
        }
        Command::Provision {
            backend,
            install_root,
        } => {
            if let Some(root) = install_root {
                config.install_root = root;
            }
            let backend = backend.unwrap_or(config.backend);
            tokio::task::spawn_blocking(move || provision(config, backend)).await?
        }
        Command::Status { install_root } => {
            if let Some(root) = install_root {
                config.install_root = root;
            }
            print_status(&config);
            Ok(())
        }
        Command::Render { profile, write } => {
            let backend = profile.apply(&mut config);
            render(&config, backend, write)
        }
        Command::Serve { profile, port } => {
            let backend = profile.apply(&mut config);
            let host = Arc::new(MiningHost::new(config.session_options()));
            let defaults = ServerDefaults {
                backend,
                profile: config.profile.clone(),
            };
            server::run_server(port, host, defaults).await
        }
    }
}

fn print_banner(config: &AppConfig, backend: BackendKind) {
    println!("⛏️  Mining Session");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("🔧 Backend: {}", backend);
    println!("🌐 Pool: {}", config.profile.pool);
    println!("👛 Wallet: {}", config.profile.masked_wallet());
    println!("🏷️  Worker: {}", config.profile.worker);
    println!(
        "🧵 Threads: {} (CPU cap {}%)",
        config.profile.effective_threads(),
        config.profile.max_cpu_usage
    );
    println!("📁 Install root: {}", config.install_root.display());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}

fn run_session(config: AppConfig, backend: BackendKind) -> Result<()> {
    print_banner(&config, backend);

    let host = MiningHost::new(config.session_options());
    let cancel = CancelToken::new();
    let interrupted = Arc::new(AtomicBool::new(false));

    let cancel_ctrlc = cancel.clone();
    let interrupted_ctrlc = interrupted.clone();
    ctrlc::set_handler(move || {
        cancel_ctrlc.cancel();
        interrupted_ctrlc.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    println!("📦 Preparing {} (provisioning may download the worker)...", backend);
    let handle = host
        .start_session_cancellable(config.profile.clone(), backend, &cancel)
        .context("Failed to start session")?;
    let events = host
        .subscribe_metrics(&handle)
        .context("Event stream already taken")?;
    println!("📝 Log: {}\n", handle.log_path().display());

    let mut display = MetricsDisplay::new(backend);
    let mut stop_sent = false;
    loop {
        if interrupted.load(Ordering::SeqCst) && !stop_sent {
            display.note("stopping worker...");
            host.stop_session(&handle);
            stop_sent = true;
        }

        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => {
                if !display.handle(&event) {
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    host.stop_session(&handle);
    display.finish();
    Ok(())
}

fn provision(config: AppConfig, backend: BackendKind) -> Result<()> {
    let host = MiningHost::new(config.session_options());
    let cancel = CancelToken::new();
    let cancel_ctrlc = cancel.clone();
    ctrlc::set_handler(move || cancel_ctrlc.cancel()).context("Failed to set Ctrl+C handler")?;

    let descriptor = backend.descriptor();
    match &descriptor.artifact {
        Some(artifact) => println!("📥 Provisioning {} from {}", backend, artifact.url),
        None => println!("📥 {} needs no download", backend),
    }

    match host.provision(backend, &cancel) {
        ProvisionState::Ready => {
            println!(
                "✅ {} ready at {}",
                backend,
                descriptor.install_path(&config.install_root).display()
            );
            Ok(())
        }
        state => anyhow::bail!("Provisioning {} {}", backend, state),
    }
}

fn print_status(config: &AppConfig) {
    let host = MiningHost::new(config.session_options());
    println!("📁 Install root: {}", config.install_root.display());
    for backend in BackendKind::ALL {
        let state = host.provision_status(backend);
        let marker = if state.is_ready() { "✅" } else { "⬜" };
        println!("{} {:<10} {}", marker, backend.as_str(), state);
    }
}

fn render(config: &AppConfig, backend: BackendKind, write: bool) -> Result<()> {
    let backend_impl = create_backend(backend, &config.simulator);
    let install_path = backend.descriptor().install_path(&config.install_root);

    let rendered = if write {
        ConfigGenerator::render(&config.profile, backend_impl.as_ref(), &install_path)?
    } else {
        ConfigGenerator::preview(&config.profile, backend_impl.as_ref(), &install_path)?
    };

    println!("# {}", rendered.path.display());
    print!("{}", rendered.contents);
    Ok(())
}
