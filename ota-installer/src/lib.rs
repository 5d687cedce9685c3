// OTA Installer
// Library entry point

pub mod archive;
pub mod config;
pub mod download;
pub mod error;
pub mod handlers;
pub mod installer;
pub mod location;
pub mod notifier;
pub mod properties;
pub mod push;
pub mod rms;
pub mod security;
pub mod storage;
pub mod utils;
pub mod version;

#[cfg(test)]
mod test_support;

pub use config::InstallerConfig;
pub use download::Credentials;
pub use error::{InstallError, InstallErrorKind};
pub use installer::{
    InstallCoordinator, InstallHandle, InstallListener, InstallPhase, InstallRequest,
    InstallSource, InstallState, InstallStep,
};
pub use notifier::OtaStatus;
pub use security::{PermissionCatalog, PermissionLevel};
pub use storage::{FileSuiteStorage, InstalledSuite, SuiteId, SuiteStorage};

use anyhow::Context;
use std::path::Path;

/// Initialize logging with dual format (JSON + human-readable) under `log_dir`.
///
/// Stdout output is optional so interactive prompts are not interleaved with log lines.
pub fn init_logging(log_dir: &Path, with_stdout: bool) -> anyhow::Result<()> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {:?}", log_dir))?;

    let timestamp = chrono::Utc::now().format("%Y-%m-%d-%H%M%S");
    let json_log_file = log_dir.join(format!("installer-{}.log", timestamp));
    let txt_log_file = log_dir.join(format!("installer-{}.txt", timestamp));

    let mut dispatch = fern::Dispatch::new().level(log::LevelFilter::Debug);

    if with_stdout {
        dispatch = dispatch.chain(
            fern::Dispatch::new()
                .level(log::LevelFilter::Info)
                .format(|out, message, record| {
                    out.finish(format_args!("{}", human_line(&message.to_string(), record)))
                })
                .chain(std::io::stdout()),
        );
    }

    dispatch = dispatch
        .chain(
            fern::Dispatch::new()
                .format(|out, message, record| {
                    let timestamp_utc = chrono::Utc::now().to_rfc3339();
                    let message_str = message.to_string();
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let (details, performance) = utils::logging::parse_log_fields(&cleaned_message);
                    let json_line = utils::logging::format_json_log(
                        &timestamp_utc,
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                        Some(&details),
                        Some(&performance),
                    );
                    out.finish(format_args!("{}\n", json_line))
                })
                .chain(
                    fern::log_file(&json_log_file)
                        .with_context(|| format!("Failed to open {:?}", json_log_file))?,
                ),
        )
        .chain(
            fern::Dispatch::new()
                .format(|out, message, record| {
                    out.finish(format_args!("{}\n", human_line(&message.to_string(), record)))
                })
                .chain(
                    fern::log_file(&txt_log_file)
                        .with_context(|| format!("Failed to open {:?}", txt_log_file))?,
                ),
        );

    dispatch
        .apply()
        .context("Failed to install the global logger")?;

    log::info!(
        "[PHASE: initialization] [STEP: logging] Logging initialized (log_dir={:?})",
        log_dir
    );
    Ok(())
}

fn human_line(message: &str, record: &log::Record) -> String {
    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let (phase, step, cleaned_message) = utils::logging::parse_log_metadata(message);
    utils::logging::format_human_readable_log(
        &timestamp_local.to_string(),
        record.level(),
        record.target(),
        &cleaned_message,
        phase.as_deref(),
        step.as_deref(),
    )
}
