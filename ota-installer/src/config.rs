// Installer configuration.
//
// Layering: built-in defaults, then an optional TOML file, then `OTA_INSTALLER_*` environment
// variables (`__` separates nested keys, e.g. `OTA_INSTALLER_DEVICE__LOCALE=en-US`).

use crate::download::DownloaderSettings;
use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "OTA_INSTALLER";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Supported profiles, e.g. `MIDP-2.1`.
    pub profiles: Vec<String>,
    /// Device configuration, e.g. `CLDC-1.1`.
    pub configuration: String,
    /// Sent as `Accept-Language` when set.
    pub locale: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            profiles: vec!["MIDP-2.1".to_string()],
            configuration: "CLDC-1.1".to_string(),
            locale: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Connection schemes the push subsystem can listen on.
    pub supported_protocols: Vec<String>,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            supported_protocols: ["socket", "datagram", "sms", "cbs", "mms"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// A pinned signer key: suites whose `MIDlet-Jar-RSA-SHA1` verifies against `public_key`
/// (base64 PKCS#1 DER) are bound to `domain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedSignerConfig {
    pub name: String,
    pub domain: String,
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    pub storage_root: PathBuf,
    pub log_dir: Option<PathBuf>,
    /// Security policy TOML; the built-in policy is used when unset.
    pub policy_file: Option<PathBuf>,
    /// Domain for unsigned suites; the policy's own `unsigned_domain` when unset.
    pub unsigned_domain: Option<String>,
    pub device: DeviceConfig,
    pub min_install_duration_ms: u64,
    pub max_retry_after_secs: u64,
    pub http_timeout_secs: u64,
    pub use_system_proxy: bool,
    pub push: PushConfig,
    pub notify_enabled: bool,
    pub trusted_signers: Vec<TrustedSignerConfig>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        let storage_root = crate::utils::path_resolver::resolve_storage_root()
            .unwrap_or_else(|_| PathBuf::from("ota-installer-data"));
        Self {
            storage_root,
            log_dir: None,
            policy_file: None,
            unsigned_domain: None,
            device: DeviceConfig::default(),
            min_install_duration_ms: 1000,
            max_retry_after_secs: 60,
            http_timeout_secs: 60,
            use_system_proxy: true,
            push: PushConfig::default(),
            notify_enabled: true,
            trusted_signers: Vec::new(),
        }
    }
}

impl InstallerConfig {
    /// Load configuration from defaults, `file` (if given) and the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        Self::load_with_env(file, None)
    }

    /// `env` replaces the process environment when given.
    fn load_with_env(file: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let defaults = Config::try_from(&InstallerConfig::default())
            .context("Failed to build default configuration")?;

        let mut builder = Config::builder().add_source(defaults);
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("device.profiles")
                .with_list_parse_key("push.supported_protocols")
                .source(env),
        );

        let cfg: InstallerConfig = builder
            .build()
            .context("Failed to load installer configuration")?
            .try_deserialize()
            .context("Invalid installer configuration")?;

        info!(
            "[PHASE: initialization] [STEP: config] Configuration loaded (file={:?}, storage_root={:?}, signers={}, min_install_duration_ms={})",
            file,
            cfg.storage_root,
            cfg.trusted_signers.len(),
            cfg.min_install_duration_ms
        );
        Ok(cfg)
    }

    /// `Profile/<profiles> Configuration/<configuration>`
    pub fn user_agent(&self) -> String {
        format!(
            "Profile/{} Configuration/{}",
            self.device.profiles.join(" "),
            self.device.configuration
        )
    }

    pub fn downloader_settings(&self) -> DownloaderSettings {
        DownloaderSettings {
            user_agent: self.user_agent(),
            locale: self.device.locale.clone(),
            max_retry_after: Duration::from_secs(self.max_retry_after_secs),
            connect_timeout: Duration::from_secs(self.http_timeout_secs),
            use_system_proxy: self.use_system_proxy,
        }
    }

    pub fn min_install_duration(&self) -> Duration {
        Duration::from_millis(self.min_install_duration_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env() -> Option<HashMap<String, String>> {
        Some(HashMap::new())
    }

    #[test]
    fn defaults_without_file_or_env() {
        let cfg = InstallerConfig::load_with_env(None, no_env()).unwrap();
        assert_eq!(cfg.min_install_duration_ms, 1000);
        assert_eq!(cfg.max_retry_after_secs, 60);
        assert_eq!(cfg.device.profiles, vec!["MIDP-2.1".to_string()]);
        assert_eq!(cfg.device.configuration, "CLDC-1.1");
        assert_eq!(cfg.push.supported_protocols.len(), 5);
        assert!(cfg.notify_enabled);
        assert!(cfg.trusted_signers.is_empty());
        assert_eq!(cfg.user_agent(), "Profile/MIDP-2.1 Configuration/CLDC-1.1");
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("installer.toml");
        std::fs::write(
            &path,
            r#"
storage_root = "/srv/ota"
min_install_duration_ms = 0

[device]
profiles = ["MIDP-2.0", "JSR75-1.0"]
configuration = "CLDC-1.0"
locale = "fi-FI"

[[trusted_signers]]
name = "acme"
domain = "operator"
public_key = "AAAA"
"#,
        )
        .unwrap();

        let cfg = InstallerConfig::load_with_env(Some(&path), no_env()).unwrap();
        assert_eq!(cfg.storage_root, PathBuf::from("/srv/ota"));
        assert_eq!(cfg.min_install_duration_ms, 0);
        assert_eq!(cfg.device.locale.as_deref(), Some("fi-FI"));
        assert_eq!(cfg.trusted_signers[0].domain, "operator");
        assert_eq!(cfg.http_timeout_secs, 60, "unset keys keep their defaults");
        assert_eq!(
            cfg.downloader_settings().user_agent,
            "Profile/MIDP-2.0 JSR75-1.0 Configuration/CLDC-1.0"
        );
    }

    #[test]
    fn environment_overrides_file() {
        let env: HashMap<String, String> = [
            ("OTA_INSTALLER_MIN_INSTALL_DURATION_MS", "250"),
            ("OTA_INSTALLER_DEVICE__LOCALE", "en-GB"),
            ("OTA_INSTALLER_PUSH__SUPPORTED_PROTOCOLS", "socket,sms"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let cfg = InstallerConfig::load_with_env(None, Some(env)).unwrap();
        assert_eq!(cfg.min_install_duration_ms, 250);
        assert_eq!(cfg.device.locale.as_deref(), Some("en-GB"));
        assert_eq!(
            cfg.push.supported_protocols,
            vec!["socket".to_string(), "sms".to_string()]
        );
    }

    #[test]
    fn partial_file_without_signers_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("installer.toml");
        std::fs::write(&path, "[device]\nlocale = \"de-DE\"\n").unwrap();

        let cfg = InstallerConfig::load_with_env(Some(&path), no_env()).unwrap();
        assert!(cfg.trusted_signers.is_empty());
        assert_eq!(cfg.device.locale.as_deref(), Some("de-DE"));
        assert_eq!(cfg.device.configuration, "CLDC-1.1");
        assert_eq!(cfg.push.supported_protocols.len(), 5);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(InstallerConfig::load_with_env(Some(&dir.path().join("absent.toml")), no_env()).is_err());
    }
}
