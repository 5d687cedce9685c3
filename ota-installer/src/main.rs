// OTA Installer
// Command-line entry point

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use dialoguer::{Confirm, Input, Password};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use ota_installer::push::FilePushRegistry;
use ota_installer::security::PinnedSignerVerifier;
use ota_installer::utils::path_resolver;
use ota_installer::{
    Credentials, FileSuiteStorage, InstallCoordinator, InstallError, InstallHandle,
    InstallListener, InstallPhase, InstallRequest, InstallState, InstallerConfig,
    PermissionCatalog, SuiteStorage,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "ota-installer", version, about = "Install MIDlet suites over the air")]
struct Cli {
    /// Configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Echo log lines to stdout.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Install or upgrade a suite from a descriptor (or, with --jar, archive) URL.
    Install(InstallArgs),
    /// List installed suites.
    List,
    /// Print a security domain's permission levels.
    ShowDomain { name: String },
}

#[derive(Args)]
struct InstallArgs {
    url: String,

    /// The URL points at the archive; there is no descriptor.
    #[arg(long)]
    jar: bool,

    /// Overwrite an installed version without asking about version order.
    #[arg(long)]
    force: bool,

    /// Discard the previous version's record stores.
    #[arg(long)]
    remove_rms: bool,

    /// Answer yes to every question.
    #[arg(long, short = 'y')]
    yes: bool,

    #[arg(long, requires = "password")]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    #[arg(long, requires = "proxy_password")]
    proxy_username: Option<String>,

    #[arg(long)]
    proxy_password: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("[PHASE: initialization] [STEP: main] Fatal error (err={:#})", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = InstallerConfig::load(cli.config.as_deref())?;
    let log_dir = path_resolver::resolve_log_folder(config.log_dir.as_deref())?;
    if let Err(e) = ota_installer::init_logging(&log_dir, cli.verbose) {
        eprintln!("Failed to initialize logging: {:#}", e);
    }
    info!(
        "[PHASE: initialization] [STEP: main] Installer starting (version={}, storage_root={:?}, config={:?})",
        env!("CARGO_PKG_VERSION"),
        config.storage_root,
        cli.config
    );

    match cli.command {
        Command::Install(args) => install(&config, args).await,
        Command::List => list(&config).await,
        Command::ShowDomain { name } => show_domain(&config, &name),
    }
}

fn load_catalog(config: &InstallerConfig) -> Result<PermissionCatalog> {
    match &config.policy_file {
        Some(path) => PermissionCatalog::load(path),
        None => PermissionCatalog::builtin(),
    }
}

async fn install(config: &InstallerConfig, args: InstallArgs) -> Result<ExitCode> {
    let catalog = Arc::new(load_catalog(config)?);
    let storage = Arc::new(FileSuiteStorage::open(&config.storage_root).await?);
    let registry = Arc::new(FilePushRegistry::new(&config.storage_root));

    let mut builder = InstallCoordinator::builder(config, catalog, storage, registry);
    if !config.trusted_signers.is_empty() {
        let verifier = PinnedSignerVerifier::from_config(&config.trusted_signers)
            .context("Invalid trusted signer configuration")?;
        builder = builder.trust_verifier(Arc::new(verifier));
    }
    let coordinator = builder.build()?;

    let mut request = if args.jar {
        InstallRequest::from_archive(args.url)
    } else {
        InstallRequest::from_descriptor(args.url)
    };
    request.force = args.force;
    request.remove_rms = args.remove_rms;
    request.credentials = args
        .username
        .zip(args.password)
        .map(|(u, p)| Credentials::new(u, p));
    request.proxy_credentials = args
        .proxy_username
        .zip(args.proxy_password)
        .map(|(u, p)| Credentials::new(u, p));

    let listener = CliListener::new(args.yes);
    let handle = InstallHandle::new();
    let stopper = handle.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() && !stopper.stop() {
            eprintln!("The suite is already being stored; it can no longer be stopped.");
        }
    });

    let started = Instant::now();
    let result = coordinator.install(request, Some(&listener), &handle).await;
    ctrl_c.abort();
    listener.progress.finish_and_clear();

    match result {
        Ok(id) => {
            println!("Installed {} in {} ms", id, started.elapsed().as_millis());
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            report_failure(&e);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn report_failure(e: &InstallError) {
    match e.status() {
        Some(status) => eprintln!("Installation failed: {} [{}]", e, status.message()),
        None => eprintln!("Installation failed: {}", e),
    }
}

async fn list(config: &InstallerConfig) -> Result<ExitCode> {
    let storage = FileSuiteStorage::open(&config.storage_root).await?;
    let mut suites = storage
        .list_suites()
        .await
        .context("Failed to list installed suites")?;
    suites.sort_by(|a, b| (&a.vendor, &a.name).cmp(&(&b.vendor, &b.name)));

    if suites.is_empty() {
        println!("No suites installed.");
        return Ok(ExitCode::SUCCESS);
    }
    for suite in suites {
        println!(
            "{}  {} {} ({})  domain={}  installed={}",
            suite.id,
            suite.name,
            suite.version,
            suite.vendor,
            suite.domain,
            suite.installed_at.to_rfc3339()
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn show_domain(config: &InstallerConfig, name: &str) -> Result<ExitCode> {
    let catalog = load_catalog(config)?;
    let Some(domain) = catalog.domain(name) else {
        let known: Vec<&str> = catalog.domains().iter().map(|d| d.name()).collect();
        eprintln!("Unknown domain '{}' (known: {})", name, known.join(", "));
        return Ok(ExitCode::FAILURE);
    };

    println!("{} (trusted={})", domain.name(), domain.is_trusted());
    for id in 0..catalog.len() {
        let Some(permission) = catalog.permission_name(id) else {
            continue;
        };
        println!(
            "  {:<60} {:<16} max {}",
            permission,
            domain.current().get(id).as_str(),
            domain.maximum().get(id).as_str()
        );
    }
    Ok(ExitCode::SUCCESS)
}

/// Terminal prompts and a transfer progress bar.
struct CliListener {
    assume_yes: bool,
    progress: ProgressBar,
}

impl CliListener {
    fn new(assume_yes: bool) -> Self {
        let progress = ProgressBar::new(0);
        let style = ProgressStyle::with_template("{msg} [{bar:40}] {bytes}/{total_bytes}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        progress.set_style(style);
        Self {
            assume_yes,
            progress,
        }
    }

    async fn confirm(&self, prompt: String, default: bool) -> bool {
        if self.assume_yes {
            return true;
        }
        let progress = self.progress.clone();
        let answer = tokio::task::spawn_blocking(move || {
            progress.suspend(|| {
                Confirm::new()
                    .with_prompt(prompt)
                    .default(default)
                    .interact()
            })
        })
        .await;
        match answer {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => {
                warn!("[PHASE: install] [STEP: prompt] Prompt failed; declining (err={})", e);
                false
            }
            Err(e) => {
                warn!("[PHASE: install] [STEP: prompt] Prompt task failed; declining (err={})", e);
                false
            }
        }
    }
}

#[async_trait]
impl InstallListener for CliListener {
    async fn update_status(&self, phase: InstallPhase, state: &InstallState) {
        match phase {
            InstallPhase::DownloadingDescriptor => self.progress.set_message("Fetching descriptor"),
            InstallPhase::DescriptorProgress { .. } => {}
            InstallPhase::DownloadingArchive => {
                self.progress.set_length(state.expected_archive_size.unwrap_or(0));
                self.progress.set_position(0);
                self.progress.set_message("Downloading");
            }
            InstallPhase::ArchiveProgress { bytes } => {
                if state.expected_archive_size.is_none() {
                    self.progress.set_length(bytes);
                }
                self.progress.set_position(bytes);
            }
            InstallPhase::Verifying => self.progress.set_message("Verifying"),
            InstallPhase::GeneratingAppImage => self.progress.set_message("Preparing"),
            InstallPhase::Storing => self.progress.set_message("Storing"),
            InstallPhase::CorruptedPreviousSuite => self.progress.suspend(|| {
                eprintln!("The installed copy of this suite is damaged and will be replaced.")
            }),
        }
    }

    async fn warn_user(&self, _state: &InstallState, warning: &InstallError) -> bool {
        self.confirm(format!("{}. Continue?", warning), false).await
    }

    async fn confirm_archive_download(&self, state: &InstallState) -> bool {
        let prompt = format!(
            "Install {} {} from {} ({} bytes)?",
            state.suite_name.as_deref().unwrap_or("?"),
            state.version.as_deref().unwrap_or("?"),
            state.vendor.as_deref().unwrap_or("?"),
            state.expected_archive_size.unwrap_or(0)
        );
        self.confirm(prompt, true).await
    }

    async fn confirm_auth_path(&self, state: &InstallState) -> bool {
        let prompt = format!(
            "Suite is signed by {}. Trust this signer?",
            state.auth_path.join(" / ")
        );
        self.confirm(prompt, false).await
    }

    async fn keep_rms_data(&self, _state: &InstallState) -> bool {
        self.confirm("Keep the data saved by the previous version?".to_string(), true)
            .await
    }

    async fn credentials(&self, _state: &InstallState, proxy: bool) -> Option<Credentials> {
        if self.assume_yes {
            return None;
        }
        let target = if proxy { "Proxy" } else { "Server" };
        let progress = self.progress.clone();
        let answer = tokio::task::spawn_blocking(move || {
            progress.suspend(|| -> dialoguer::Result<Credentials> {
                let username: String = Input::new()
                    .with_prompt(format!("{} username", target))
                    .interact_text()?;
                let password = Password::new()
                    .with_prompt(format!("{} password", target))
                    .interact()?;
                Ok(Credentials::new(username, password))
            })
        })
        .await;
        match answer {
            Ok(Ok(credentials)) => Some(credentials),
            Ok(Err(e)) => {
                warn!("[PHASE: install] [STEP: prompt] Credential prompt failed (proxy={}, err={})", proxy, e);
                None
            }
            Err(e) => {
                warn!("[PHASE: install] [STEP: prompt] Credential prompt task failed (err={})", e);
                None
            }
        }
    }
}
