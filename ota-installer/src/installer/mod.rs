// Installation pipeline.
//
// IMPORTANT:
// - Nothing persistent changes before the final `commit_suite` call; push registrations made in
//   step 7 are rolled back on any later failure.
// - Every run ends with temp-file cleanup and at most one provider notification, whatever happened.

mod listener;
mod state;

pub use listener::{InstallListener, InstallPhase};
pub use state::{InstallHandle, InstallState, InstallStep, StepOutcome};

use crate::archive::ArchiveVerifier;
use crate::config::{DeviceConfig, InstallerConfig};
use crate::download::{
    Credentials, DownloadError, FetchRequest, ResourceDownloader, ResourceKind, TransferObserver,
};
use crate::error::{InstallError, InstallErrorKind};
use crate::handlers::{AppImageGenerator, ContentHandlerRegistry, NoContentHandlers};
use crate::location::{resolve_archive_url, same_origin};
use crate::notifier::{HttpOtaNotifier, OtaNotifier, OtaStatus, SilentNotifier};
use crate::properties::{
    self, Charset, PropertyError, PropertyStore, MICROEDITION_CONFIGURATION, MICROEDITION_PROFILE,
    MIDLET_DATA_SIZE, MIDLET_INSTALL_NOTIFY, MIDLET_JAR_SIZE, MIDLET_JAR_URL, MIDLET_NAME,
    MIDLET_PERMISSIONS, MIDLET_PERMISSIONS_OPT, MIDLET_VENDOR, MIDLET_VERSION,
};
use crate::push::{parse_push_entries, push_interrupt_settings, PushMigration, PushRegistry};
use crate::rms::{RmsDecision, RmsRetentionPolicy};
use crate::security::{
    apply_prior_user_levels, ArchiveTrustVerifier, NoSignatureVerifier, PermissionCatalog,
    PermissionLevel, PermissionPolicyEngine, PermissionSet, PUSH_REGISTRY_PERMISSION,
};
use crate::storage::{CommitRequest, InstalledSuite, SuiteId, SuiteLookup, SuiteStorage};
use crate::utils::logging::mask_url_credentials;
use crate::version::{check_version_format, compare_versions, matches_named_version};
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use state::InstallControl;
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;

/// Where the installation starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallSource {
    /// Descriptor (JAD) URL; the archive URL is read from it.
    Descriptor(String),
    /// Archive (JAR) URL; the manifest alone identifies the suite.
    Archive(String),
}

#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub source: InstallSource,
    /// Overwrite any installed version without the version warnings.
    pub force: bool,
    /// Drop the previous version's record stores unconditionally.
    pub remove_rms: bool,
    pub credentials: Option<Credentials>,
    pub proxy_credentials: Option<Credentials>,
}

impl InstallRequest {
    pub fn from_descriptor(url: impl Into<String>) -> Self {
        Self::new(InstallSource::Descriptor(url.into()))
    }

    pub fn from_archive(url: impl Into<String>) -> Self {
        Self::new(InstallSource::Archive(url.into()))
    }

    fn new(source: InstallSource) -> Self {
        Self {
            source,
            force: false,
            remove_rms: false,
            credentials: None,
            proxy_credentials: None,
        }
    }
}

pub struct InstallCoordinatorBuilder {
    config: InstallerConfig,
    catalog: Arc<PermissionCatalog>,
    storage: Arc<dyn SuiteStorage>,
    push_registry: Arc<dyn PushRegistry>,
    trust_verifier: Option<Arc<dyn ArchiveTrustVerifier>>,
    notifier: Option<Arc<dyn OtaNotifier>>,
    content_handlers: Option<Arc<dyn ContentHandlerRegistry>>,
    app_image_generator: Option<Arc<dyn AppImageGenerator>>,
}

impl InstallCoordinatorBuilder {
    pub fn trust_verifier(mut self, verifier: Arc<dyn ArchiveTrustVerifier>) -> Self {
        self.trust_verifier = Some(verifier);
        self
    }

    /// Replaces the notifier chosen from `notify_enabled`.
    pub fn notifier(mut self, notifier: Arc<dyn OtaNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn content_handlers(mut self, registry: Arc<dyn ContentHandlerRegistry>) -> Self {
        self.content_handlers = Some(registry);
        self
    }

    pub fn app_image_generator(mut self, generator: Arc<dyn AppImageGenerator>) -> Self {
        self.app_image_generator = Some(generator);
        self
    }

    pub fn build(self) -> anyhow::Result<InstallCoordinator> {
        let config = self.config;
        let unsigned_domain = config
            .unsigned_domain
            .clone()
            .unwrap_or_else(|| self.catalog.unsigned_domain().to_string());
        if self.catalog.domain(&unsigned_domain).is_none() {
            anyhow::bail!(
                "Unsigned domain '{}' is not defined by the security policy",
                unsigned_domain
            );
        }

        let downloader = ResourceDownloader::new(config.downloader_settings())
            .context("Failed to create resource downloader")?;

        let notifier: Arc<dyn OtaNotifier> = match self.notifier {
            Some(notifier) => notifier,
            None if config.notify_enabled => Arc::new(
                HttpOtaNotifier::new(
                    Duration::from_secs(config.http_timeout_secs),
                    config.use_system_proxy,
                )
                .context("Failed to create provider notifier")?,
            ),
            None => Arc::new(SilentNotifier),
        };

        info!(
            "[PHASE: initialization] [STEP: installer] Install coordinator ready (unsigned_domain={}, signature_checks={}, app_images={})",
            unsigned_domain,
            self.trust_verifier.is_some(),
            self.app_image_generator.is_some()
        );

        Ok(InstallCoordinator {
            downloader,
            verifier: ArchiveVerifier::new(),
            policy: PermissionPolicyEngine::new(self.catalog),
            push: PushMigration::new(self.push_registry, &config.push.supported_protocols),
            storage: self.storage,
            trust: self
                .trust_verifier
                .unwrap_or_else(|| Arc::new(NoSignatureVerifier)),
            notifier,
            content_handlers: self
                .content_handlers
                .unwrap_or_else(|| Arc::new(NoContentHandlers)),
            app_images: self.app_image_generator,
            unsigned_domain,
            device: config.device.clone(),
            min_install_duration: config.min_install_duration(),
        })
    }
}

/// Drives installations. One coordinator can run any number of installs; each call to
/// [`InstallCoordinator::install`] owns its own state.
pub struct InstallCoordinator {
    downloader: ResourceDownloader,
    verifier: ArchiveVerifier,
    policy: PermissionPolicyEngine,
    push: PushMigration,
    storage: Arc<dyn SuiteStorage>,
    trust: Arc<dyn ArchiveTrustVerifier>,
    notifier: Arc<dyn OtaNotifier>,
    content_handlers: Arc<dyn ContentHandlerRegistry>,
    app_images: Option<Arc<dyn AppImageGenerator>>,
    unsigned_domain: String,
    device: DeviceConfig,
    min_install_duration: Duration,
}

impl InstallCoordinator {
    pub fn builder(
        config: &InstallerConfig,
        catalog: Arc<PermissionCatalog>,
        storage: Arc<dyn SuiteStorage>,
        push_registry: Arc<dyn PushRegistry>,
    ) -> InstallCoordinatorBuilder {
        InstallCoordinatorBuilder {
            config: config.clone(),
            catalog,
            storage,
            push_registry,
            trust_verifier: None,
            notifier: None,
            content_handlers: None,
            app_image_generator: None,
        }
    }

    /// Run one installation to completion.
    ///
    /// Without a listener every warning is fatal. `handle` may be used from another task to stop
    /// the installation until the suite is being committed.
    pub async fn install(
        &self,
        request: InstallRequest,
        listener: Option<&dyn InstallListener>,
        handle: &InstallHandle,
    ) -> Result<SuiteId, InstallError> {
        let started = Instant::now();
        let (first_step, descriptor_url, archive_url) = match request.source {
            InstallSource::Descriptor(url) => (InstallStep::FetchDescriptor, Some(url), None),
            InstallSource::Archive(url) => (InstallStep::FetchArchive, None, Some(url)),
        };
        info!(
            "[PHASE: install] [STEP: start] install entered (descriptor_url={}, archive_url={}, force={}, remove_rms={}, listener={})",
            descriptor_url.as_deref().map(mask_url_credentials).unwrap_or_default(),
            archive_url.as_deref().map(mask_url_credentials).unwrap_or_default(),
            request.force,
            request.remove_rms,
            listener.is_some()
        );

        let mut state = InstallState::new(first_step);
        state.descriptor_url = descriptor_url;
        state.archive_url = archive_url;
        state.force = request.force;
        state.remove_rms = request.remove_rms;
        state.credentials = request.credentials;
        state.proxy_credentials = request.proxy_credentials;

        let mut run = Installation {
            coordinator: self,
            state,
            listener,
            control: handle.control(),
            started,
        };
        let result = run.run().await;
        run.cleanup().await;
        run.report(&result).await;

        match &result {
            Ok(id) => info!(
                "[PHASE: install] [STEP: done] install exit ok (suite_id={}, duration_ms={})",
                id,
                started.elapsed().as_millis()
            ),
            Err(e) => warn!(
                "[PHASE: install] [STEP: done] install failed (step={}, kind={:?}, err={}, duration_ms={})",
                run.state.current_step.name(),
                e.kind(),
                e,
                started.elapsed().as_millis()
            ),
        }
        result
    }
}

/// One installation attempt.
struct Installation<'a> {
    coordinator: &'a InstallCoordinator,
    state: InstallState,
    listener: Option<&'a dyn InstallListener>,
    control: &'a InstallControl,
    started: Instant,
}

impl<'a> Installation<'a> {
    async fn run(&mut self) -> Result<SuiteId, InstallError> {
        while self.state.current_step != InstallStep::Done {
            if self.control.is_stop_requested() {
                return Err(InstallError::cancelled());
            }
            self.state.last_warning = None;

            let step = self.state.current_step;
            let step_started = Instant::now();
            debug!(
                "[PHASE: install] [STEP: {}] step entered (number={})",
                step.name(),
                step.number()
            );
            let outcome = match self.run_step(step).await {
                Ok(outcome) => outcome,
                Err(e) => StepOutcome::from(e),
            };
            debug!(
                "[PHASE: install] [STEP: {}] step exit (outcome={}, duration_ms={})",
                step.name(),
                match &outcome {
                    StepOutcome::Continue => "continue",
                    StepOutcome::Warn(_) => "warn",
                    StepOutcome::Fatal(_) => "fatal",
                },
                step_started.elapsed().as_millis()
            );

            match outcome {
                StepOutcome::Continue => self.state.current_step = step.next(),
                StepOutcome::Fatal(e) => return Err(e),
                StepOutcome::Warn(warning) => {
                    if self.resolve_warning(warning).await? {
                        self.state.current_step = step.next();
                    }
                }
            }
        }

        self.state
            .suite_id
            .clone()
            .ok_or_else(|| InstallError::with_detail(InstallErrorKind::StorageFailure, "no suite id"))
    }

    /// Ask the listener about a warning. `Ok(true)` advances, `Ok(false)` re-runs the step.
    async fn resolve_warning(&mut self, warning: InstallError) -> Result<bool, InstallError> {
        warn!(
            "[PHASE: install] [STEP: {}] Warning raised (kind={:?}, detail={})",
            self.state.current_step.name(),
            warning.kind(),
            warning.detail().unwrap_or_default()
        );
        self.state.last_warning = Some(warning.clone());

        let Some(listener) = self.listener else {
            return Err(warning);
        };
        if !listener.warn_user(&self.state, &warning).await {
            info!(
                "[PHASE: install] [STEP: {}] Warning declined (kind={:?})",
                self.state.current_step.name(),
                warning.kind()
            );
            self.control.request_cancel();
            return Err(warning.with_status(OtaStatus::UserCancelled));
        }
        if !warning.kind().reruns_step() {
            return Ok(true);
        }

        let proxy = warning.kind() == InstallErrorKind::ProxyAuth;
        match listener.credentials(&self.state, proxy).await {
            Some(credentials) if proxy => self.state.proxy_credentials = Some(credentials),
            Some(credentials) => self.state.credentials = Some(credentials),
            None => return Err(warning),
        }
        info!(
            "[PHASE: install] [STEP: {}] Credentials supplied; repeating step (proxy={})",
            self.state.current_step.name(),
            proxy
        );
        Ok(false)
    }

    async fn run_step(&mut self, step: InstallStep) -> Result<StepOutcome, InstallError> {
        match step {
            InstallStep::FetchDescriptor => self.fetch_descriptor().await,
            InstallStep::CheckContinuity => {
                let url = self.state.descriptor_url.clone();
                Ok(self.check_continuity(url.as_deref()))
            }
            InstallStep::CheckStorage => self.check_storage().await,
            InstallStep::ConfirmUser => self.confirm_user().await,
            InstallStep::FetchArchive => self.fetch_archive().await,
            InstallStep::CheckArchiveContinuity => {
                if self.state.descriptor_url.is_some() {
                    return Ok(StepOutcome::Continue);
                }
                let url = self.state.archive_url.clone();
                Ok(self.check_continuity(url.as_deref()))
            }
            InstallStep::CommitPermissionsAndStore => self.commit().await,
            InstallStep::Done => Ok(StepOutcome::Continue),
        }
    }

    async fn status(&self, phase: InstallPhase) {
        if let Some(listener) = self.listener {
            listener.update_status(phase, &self.state).await;
        }
    }

    /// Download `url` into `sink`, relaying progress and honouring cancellation.
    async fn download<W>(
        &self,
        url: &str,
        kind: ResourceKind,
        sink: &mut W,
    ) -> Result<crate::download::DownloadOutcome, InstallError>
    where
        W: tokio::io::AsyncWrite + Unpin + Send + ?Sized,
    {
        let relay = ProgressRelay {
            listener: self.listener,
            state: &self.state,
            control: self.control,
            kind,
        };
        let request = FetchRequest {
            url,
            kind,
            credentials: self.state.credentials.as_ref(),
            proxy_credentials: self.state.proxy_credentials.as_ref(),
        };
        self.coordinator
            .downloader
            .fetch(&request, sink, &relay, self.control.token())
            .await
            .map_err(|e| e.into_install_error(kind))
    }

    // Step 1
    async fn fetch_descriptor(&mut self) -> Result<StepOutcome, InstallError> {
        let url = self
            .state
            .descriptor_url
            .clone()
            .ok_or_else(|| InstallError::new(InstallErrorKind::InvalidJadUrl))?;
        self.status(InstallPhase::DownloadingDescriptor).await;

        let mut body: Vec<u8> = Vec::new();
        let outcome = self
            .download(&url, ResourceKind::Descriptor, &mut body)
            .await?;

        let charset =
            Charset::from_label(outcome.charset.as_deref()).map_err(descriptor_format_error)?;
        let descriptor =
            properties::parse_descriptor(&body, charset).map_err(descriptor_format_error)?;

        let (name, vendor, version) = suite_identity(&descriptor)?;
        info!(
            "[PHASE: install] [STEP: fetch_descriptor] Descriptor parsed (name={}, vendor={}, version={}, attributes={}, bytes={})",
            name,
            vendor,
            version,
            descriptor.len(),
            body.len()
        );

        self.state.descriptor_size = body.len() as u64;
        self.state.descriptor = Some(descriptor);
        self.set_identity(name, vendor, version);
        self.check_previous_version().await
    }

    fn set_identity(&mut self, name: String, vendor: String, version: String) {
        self.state.suite_id = Some(self.coordinator.storage.create_suite_id(&vendor, &name));
        self.state.suite_name = Some(name);
        self.state.vendor = Some(vendor);
        self.state.version = Some(version);
    }

    /// Look up an installed copy of the suite and warn about version ordering.
    async fn check_previous_version(&mut self) -> Result<StepOutcome, InstallError> {
        let Some(id) = self.state.suite_id.clone() else {
            return Ok(StepOutcome::Continue);
        };
        match self.coordinator.storage.lookup(&id).await? {
            SuiteLookup::NotFound => Ok(StepOutcome::Continue),
            SuiteLookup::Corrupted(_) => {
                warn!(
                    "[PHASE: install] [STEP: previous_version] Installed copy is corrupted; installing over it (suite_id={})",
                    id
                );
                self.state.previous_corrupted = true;
                self.status(InstallPhase::CorruptedPreviousSuite).await;
                Ok(StepOutcome::Continue)
            }
            SuiteLookup::Found(previous) => {
                let installed = previous.version.clone();
                self.state.is_upgrade = true;
                self.state.previous = Some(*previous);
                if self.state.force {
                    info!(
                        "[PHASE: install] [STEP: previous_version] Forced overwrite (suite_id={}, installed={})",
                        id, installed
                    );
                    return Ok(StepOutcome::Continue);
                }

                let new_version = self.state.version.clone().unwrap_or_default();
                let ordering = compare_versions(&new_version, &installed).map_err(|e| {
                    InstallError::with_detail(InstallErrorKind::InvalidVersion, e.to_string())
                })?;
                let kind = match ordering {
                    Ordering::Less => InstallErrorKind::OldVersion,
                    Ordering::Equal => InstallErrorKind::AlreadyInstalled,
                    Ordering::Greater => InstallErrorKind::NewVersion,
                };
                Ok(StepOutcome::Warn(InstallError::with_detail(kind, installed)))
            }
        }
    }

    // Steps 2 and 6
    fn check_continuity(&self, new_url: Option<&str>) -> StepOutcome {
        let (Some(previous), Some(new_url)) = (self.state.previous.as_ref(), new_url) else {
            return StepOutcome::Continue;
        };
        if !self.state.auth_path.is_empty() {
            return StepOutcome::Continue;
        }
        let previous_url = previous
            .descriptor_url
            .as_deref()
            .unwrap_or(&previous.archive_url);
        if same_origin(new_url, previous_url) {
            return StepOutcome::Continue;
        }
        info!(
            "[PHASE: install] [STEP: continuity] Suite moved to a different origin (previous={}, current={})",
            mask_url_credentials(previous_url),
            mask_url_credentials(new_url)
        );
        StepOutcome::Warn(InstallError::with_detail(
            InstallErrorKind::JadMoved,
            previous_url,
        ))
    }

    // Step 3
    async fn check_storage(&mut self) -> Result<StepOutcome, InstallError> {
        let (jar_size, data_size, jar_url) = {
            let descriptor = self
                .state
                .descriptor
                .as_ref()
                .ok_or_else(|| InstallError::new(InstallErrorKind::MissingJarSize))?;
            let jar_size = descriptor
                .get_non_empty(MIDLET_JAR_SIZE)
                .ok_or_else(|| InstallError::new(InstallErrorKind::MissingJarSize))
                .and_then(|v| parse_size(MIDLET_JAR_SIZE, v))?;
            let data_size = match descriptor.get_non_empty(MIDLET_DATA_SIZE) {
                Some(v) => parse_size(MIDLET_DATA_SIZE, v)?,
                None => 0,
            };
            let jar_url = descriptor
                .get_non_empty(MIDLET_JAR_URL)
                .ok_or_else(|| InstallError::new(InstallErrorKind::MissingJarUrl))?
                .to_string();
            (jar_size, data_size, jar_url)
        };

        let url_len = self.state.descriptor_url.as_deref().map_or(0, str::len) as u64;
        let required = jar_size
            .saturating_add(self.state.descriptor_size.saturating_mul(2))
            .saturating_add(url_len.saturating_mul(3))
            .saturating_add(data_size);
        let free = self.coordinator.storage.free_space_bytes().await?;
        info!(
            "[PHASE: install] [STEP: check_storage] Storage requirement computed (required_bytes={}, free_bytes={})",
            required, free
        );
        if required > free {
            return Err(InstallError::insufficient_storage(required));
        }

        let resolved = resolve_archive_url(self.state.descriptor_url.as_deref(), &jar_url)
            .map_err(|e| {
                InstallError::with_detail(
                    InstallErrorKind::InvalidJarUrl,
                    format!("{}: {}", jar_url, e),
                )
            })?;
        self.state.expected_archive_size = Some(jar_size);
        self.state.archive_url = Some(resolved);
        Ok(StepOutcome::Continue)
    }

    // Step 4
    async fn confirm_user(&mut self) -> Result<StepOutcome, InstallError> {
        let Some(listener) = self.listener else {
            return Ok(StepOutcome::Continue);
        };
        self.control.begin_ignore_cancel();
        let approved = listener.confirm_archive_download(&self.state).await;
        self.control.end_ignore_cancel();

        if !approved {
            info!("[PHASE: install] [STEP: confirm_user] Archive download declined");
            self.control.request_cancel();
            return Err(InstallError::cancelled());
        }
        Ok(StepOutcome::Continue)
    }

    // Step 5
    async fn fetch_archive(&mut self) -> Result<StepOutcome, InstallError> {
        let url = self
            .state
            .archive_url
            .clone()
            .ok_or_else(|| InstallError::new(InstallErrorKind::MissingJarUrl))?;

        // A re-run after an authentication warning starts from a fresh file.
        self.remove_temp_archive().await;
        let temp_dir = self.coordinator.storage.temp_dir();
        tokio::fs::create_dir_all(&temp_dir).await?;
        let temp_path = temp_dir.join(format!("installer-{}.tmp", uuid::Uuid::new_v4()));
        self.state.temp_archive = Some(temp_path.clone());

        self.status(InstallPhase::DownloadingArchive).await;
        let mut file = tokio::fs::File::create(&temp_path).await?;
        let outcome = self.download(&url, ResourceKind::Archive, &mut file).await?;
        file.flush().await?;
        drop(file);

        if let Some(expected) = self.state.expected_archive_size {
            if outcome.bytes != expected {
                return Err(InstallError::with_detail(
                    InstallErrorKind::JarSizeMismatch,
                    format!("expected {} bytes, received {}", expected, outcome.bytes),
                ));
            }
        }
        self.state.archive_size = outcome.bytes;

        self.status(InstallPhase::Verifying).await;
        let verified = self.coordinator.verifier.verify(&temp_path).await?;
        self.state.integrity_hash = Some(verified.integrity_hash);
        self.state.midlet_classes = verified.midlet_classes;
        let manifest = verified.manifest;

        if let Some(descriptor) = self.state.descriptor.as_ref() {
            cross_check_identity(descriptor, &manifest)?;
            self.state.manifest = Some(manifest);
            return Ok(StepOutcome::Continue);
        }

        let (name, vendor, version) = suite_identity(&manifest)
            .map_err(|e| e.with_status(OtaStatus::InvalidArchive))?;
        info!(
            "[PHASE: install] [STEP: fetch_archive] Identity taken from manifest (name={}, vendor={}, version={})",
            name, vendor, version
        );
        self.state.manifest = Some(manifest);
        self.set_identity(name, vendor, version);
        self.check_previous_version().await
    }

    // Step 7
    async fn commit(&mut self) -> Result<StepOutcome, InstallError> {
        let temp_path = self.state.temp_archive.clone().ok_or_else(|| {
            InstallError::with_detail(InstallErrorKind::StorageFailure, "archive was not downloaded")
        })?;
        let suite_id = self.state.suite_id.clone().ok_or_else(|| {
            InstallError::with_detail(InstallErrorKind::StorageFailure, "suite identity unknown")
        })?;

        self.bind_domain(&temp_path).await?;
        let permissions = self.compute_permissions()?;
        self.state.permissions = Some(permissions.clone());

        if let Some(previous) = self.state.previous.clone() {
            self.decide_record_stores(&previous).await?;
        }
        if self.state.remove_rms {
            self.state.discard_rms = true;
        }

        if self.control.is_stop_requested() {
            return Err(InstallError::cancelled());
        }

        self.check_device()?;

        let attributes = self.state.app_properties();
        self.coordinator
            .content_handlers
            .pre_install(&suite_id, &attributes, self.state.is_upgrade)
            .await?;

        self.register_push(&suite_id, &attributes, &permissions).await?;

        if let Err(e) = self.store(&suite_id, &temp_path, permissions).await {
            self.rollback_push(&suite_id).await;
            return Err(e);
        }
        Ok(StepOutcome::Continue)
    }

    /// Resolve signer and security domain, refusing to replace a trusted suite with an untrusted one.
    async fn bind_domain(&mut self, archive: &Path) -> Result<(), InstallError> {
        let signer = self
            .coordinator
            .trust
            .verify(archive, self.state.descriptor.as_ref())
            .await?;

        match signer {
            Some(identity) => {
                self.state.auth_path = identity.auth_path;
                self.state.domain = Some(identity.domain);
                if let Some(listener) = self.listener {
                    if !listener.confirm_auth_path(&self.state).await {
                        info!("[PHASE: install] [STEP: commit] Signer declined");
                        self.control.request_cancel();
                        return Err(InstallError::cancelled());
                    }
                }
            }
            None => {
                self.state.auth_path.clear();
                self.state.domain = Some(self.coordinator.unsigned_domain.clone());
            }
        }

        let domain = self.state.domain.clone().unwrap_or_default();
        self.state.trusted = self.coordinator.policy.catalog().is_trusted(&domain);
        info!(
            "[PHASE: policy] [STEP: domain] Security domain bound (domain={}, trusted={}, signer={})",
            domain,
            self.state.trusted,
            self.state.auth_path.first().map(String::as_str).unwrap_or("<none>")
        );

        if !self.state.trusted {
            if let Some(previous) = self.state.previous.as_ref().filter(|p| p.trusted) {
                let holder = previous
                    .auth_path
                    .first()
                    .cloned()
                    .unwrap_or_else(|| previous.domain.clone());
                return Err(InstallError::with_detail(
                    InstallErrorKind::TrustedOverwriteFailure,
                    holder,
                ));
            }
        }
        Ok(())
    }

    fn compute_permissions(&mut self) -> Result<PermissionSet, InstallError> {
        let policy = &self.coordinator.policy;
        let domain = self.state.domain.clone().unwrap_or_default();

        let mut permissions = if domain == self.coordinator.unsigned_domain {
            // Requested permissions are not evaluated for unsigned suites.
            self.state.auth_path.clear();
            policy.domain_levels(&domain)?
        } else {
            if let (Some(descriptor), Some(manifest)) =
                (self.state.descriptor.as_ref(), self.state.manifest.as_ref())
            {
                check_attribute_consistency(descriptor, manifest)?;
            }
            policy.initial_permissions(
                &domain,
                self.state.app_property(MIDLET_PERMISSIONS),
                self.state.app_property(MIDLET_PERMISSIONS_OPT),
            )?
        };

        if let Some(previous) = self.state.previous.as_ref() {
            let domain_maximum = policy.domain_levels(&domain)?.maximum;
            apply_prior_user_levels(
                &previous.permissions.current,
                &domain_maximum,
                &mut permissions.current,
            );
        }
        Ok(permissions)
    }

    async fn decide_record_stores(&mut self, previous: &InstalledSuite) -> Result<(), InstallError> {
        let has_records = self.coordinator.storage.has_record_stores(&previous.id).await?;
        let archive_url = self.state.archive_url.clone().unwrap_or_default();
        let decision = RmsRetentionPolicy::new(self.state.remove_rms).decide(
            previous,
            has_records,
            &self.state.auth_path,
            self.state.descriptor_url.as_deref(),
            &archive_url,
        );
        self.state.discard_rms = match decision {
            RmsDecision::Retain => false,
            RmsDecision::Discard => true,
            RmsDecision::AskUser => match self.listener {
                Some(listener) => !listener.keep_rms_data(&self.state).await,
                None => true,
            },
        };
        info!(
            "[PHASE: rms] [STEP: decide] Record store handling settled (suite_id={}, decision={:?}, discard={})",
            previous.id, decision, self.state.discard_rms
        );
        Ok(())
    }

    fn check_device(&self) -> Result<(), InstallError> {
        let device = &self.coordinator.device;

        let configuration = self
            .state
            .app_property(MICROEDITION_CONFIGURATION)
            .ok_or_else(|| InstallError::new(InstallErrorKind::MissingConfiguration))?
            .trim();
        if !matches_named_version(configuration, &device.configuration) {
            return Err(InstallError::with_detail(
                InstallErrorKind::DeviceIncompatible,
                configuration,
            ));
        }

        let requested: Vec<&str> = self
            .state
            .app_property(MICROEDITION_PROFILE)
            .map(|p| p.split([' ', '\t']).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        if requested.is_empty() {
            return Err(InstallError::new(InstallErrorKind::MissingProfile));
        }
        for profile in requested {
            if !device
                .profiles
                .iter()
                .any(|available| matches_named_version(profile, available))
            {
                return Err(InstallError::with_detail(
                    InstallErrorKind::DeviceIncompatible,
                    profile,
                ));
            }
        }
        Ok(())
    }

    async fn register_push(
        &mut self,
        suite_id: &SuiteId,
        attributes: &PropertyStore,
        permissions: &PermissionSet,
    ) -> Result<(), InstallError> {
        let entries = parse_push_entries(attributes)?;
        if !entries.is_empty() {
            let catalog = self.coordinator.policy.catalog();
            let allowed = catalog
                .permission_id(PUSH_REGISTRY_PERMISSION)
                .map(|id| permissions.current.get(id) != PermissionLevel::Never)
                .unwrap_or(false);
            if !allowed {
                return Err(InstallError::with_detail(
                    InstallErrorKind::AuthorizationFailure,
                    PUSH_REGISTRY_PERMISSION,
                ));
            }
        }

        let (level, options) = push_interrupt_settings(
            self.coordinator.policy.catalog(),
            &permissions.current,
            self.state.previous.as_ref(),
        );
        self.coordinator
            .policy
            .check_push_interrupt_level(&permissions.current, level)?;

        let previous_entries = if self.state.is_upgrade {
            Some(self.coordinator.push.registry().entries(suite_id).await?)
        } else {
            None
        };
        self.coordinator
            .push
            .register(
                suite_id,
                &entries,
                &self.state.midlet_classes,
                previous_entries.as_deref(),
            )
            .await?;
        self.state.previous_push_entries = previous_entries;
        self.state.push_registered = true;
        self.state.push_interrupt_level = level;
        self.state.push_options = options;
        Ok(())
    }

    async fn rollback_push(&mut self, suite_id: &SuiteId) {
        if !self.state.push_registered {
            return;
        }
        self.coordinator
            .push
            .rollback(suite_id, self.state.previous_push_entries.as_deref())
            .await;
        self.state.push_registered = false;
    }

    /// Content handler registration, the commit point, and the single storage write.
    async fn store(
        &mut self,
        suite_id: &SuiteId,
        temp_path: &Path,
        permissions: PermissionSet,
    ) -> Result<(), InstallError> {
        self.coordinator.content_handlers.install(suite_id).await?;

        if let Some(remaining) = self
            .coordinator
            .min_install_duration
            .checked_sub(self.started.elapsed())
        {
            debug!(
                "[PHASE: install] [STEP: commit] Holding before commit (remaining_ms={})",
                remaining.as_millis()
            );
            tokio::select! {
                biased;
                _ = self.control.token().cancelled() => {}
                _ = tokio::time::sleep(remaining) => {}
            }
        }

        if !self.control.enter_commit_point() {
            return Err(InstallError::cancelled());
        }
        info!(
            "[PHASE: install] [STEP: commit] Commit point reached (suite_id={})",
            suite_id
        );

        if let Some(generator) = &self.coordinator.app_images {
            self.status(InstallPhase::GeneratingAppImage).await;
            generator
                .generate(suite_id, temp_path)
                .await
                .map_err(|e| {
                    InstallError::with_detail(InstallErrorKind::StorageFailure, format!("{:#}", e))
                })?;
        }

        self.status(InstallPhase::Storing).await;
        let suite = self.installed_suite(suite_id.clone(), permissions)?;
        self.coordinator
            .storage
            .commit_suite(CommitRequest {
                suite,
                archive_source: temp_path.to_path_buf(),
                discard_record_stores: self.state.discard_rms,
            })
            .await?;
        Ok(())
    }

    fn installed_suite(
        &self,
        id: SuiteId,
        permissions: PermissionSet,
    ) -> Result<InstalledSuite, InstallError> {
        let missing = |what: &str| InstallError::with_detail(InstallErrorKind::StorageFailure, what);
        Ok(InstalledSuite {
            id,
            name: self.state.suite_name.clone().ok_or_else(|| missing("suite name"))?,
            vendor: self.state.vendor.clone().ok_or_else(|| missing("vendor"))?,
            version: self.state.version.clone().ok_or_else(|| missing("version"))?,
            descriptor_url: self.state.descriptor_url.clone(),
            archive_url: self.state.archive_url.clone().ok_or_else(|| missing("archive URL"))?,
            descriptor: self.state.descriptor.clone(),
            manifest: self.state.manifest.clone().ok_or_else(|| missing("manifest"))?,
            auth_path: self.state.auth_path.clone(),
            domain: self.state.domain.clone().ok_or_else(|| missing("domain"))?,
            trusted: self.state.trusted,
            permissions,
            push_interrupt_level: self.state.push_interrupt_level,
            push_options: self.state.push_options,
            integrity_hash: self.state.integrity_hash.clone().unwrap_or_default(),
            archive_size: self.state.archive_size,
            installed_at: Utc::now(),
        })
    }

    async fn remove_temp_archive(&mut self) {
        let Some(path) = self.state.temp_archive.take() else {
            return;
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(
                "[PHASE: install] [STEP: cleanup] Temporary archive removed (path={:?})",
                path
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "[PHASE: install] [STEP: cleanup] Failed to remove temporary archive (path={:?}, err={})",
                path, e
            ),
        }
    }

    async fn cleanup(&mut self) {
        self.remove_temp_archive().await;
    }

    /// Tell the provider how the installation ended, if it asked and the outcome has a message.
    async fn report(&self, result: &Result<SuiteId, InstallError>) {
        let status = match result {
            Ok(_) => Some(OtaStatus::Success),
            Err(e) => e.status(),
        };
        let Some(status) = status else {
            debug!("[PHASE: notify] [STEP: report] Outcome has no provider message");
            return;
        };
        let Some(url) = self.state.app_property(MIDLET_INSTALL_NOTIFY) else {
            debug!(
                "[PHASE: notify] [STEP: report] No notification URL (status={})",
                status.code()
            );
            return;
        };
        self.coordinator
            .notifier
            .notify(url, status, self.state.proxy_credentials.as_ref())
            .await;
    }
}

/// Relays transfer progress to the listener and turns a pending stop into an abort.
struct ProgressRelay<'a> {
    listener: Option<&'a dyn InstallListener>,
    state: &'a InstallState,
    control: &'a InstallControl,
    kind: ResourceKind,
}

#[async_trait]
impl<'a> TransferObserver for ProgressRelay<'a> {
    async fn on_progress(&self, bytes_so_far: u64) -> Result<(), DownloadError> {
        if self.control.is_stop_requested() {
            return Err(DownloadError::Cancelled);
        }
        if let Some(listener) = self.listener {
            let phase = match self.kind {
                ResourceKind::Descriptor => InstallPhase::DescriptorProgress {
                    bytes: bytes_so_far,
                },
                ResourceKind::Archive => InstallPhase::ArchiveProgress {
                    bytes: bytes_so_far,
                },
            };
            listener.update_status(phase, self.state).await;
        }
        Ok(())
    }
}

fn descriptor_format_error(e: PropertyError) -> InstallError {
    match e {
        PropertyError::TooManyProperties => InstallError::new(InstallErrorKind::TooManyProperties),
        other => InstallError::with_detail(InstallErrorKind::InvalidValue, other.to_string()),
    }
}

/// Name, vendor and version, all required and the version well-formed.
fn suite_identity(props: &PropertyStore) -> Result<(String, String, String), InstallError> {
    let required = |key: &str, kind: InstallErrorKind| {
        props
            .get_non_empty(key)
            .map(str::to_string)
            .ok_or_else(|| InstallError::new(kind))
    };
    let name = required(MIDLET_NAME, InstallErrorKind::MissingSuiteName)?;
    let vendor = required(MIDLET_VENDOR, InstallErrorKind::MissingVendor)?;
    let version = required(MIDLET_VERSION, InstallErrorKind::MissingVersion)?;
    check_version_format(&version)
        .map_err(|e| InstallError::with_detail(InstallErrorKind::InvalidVersion, e.to_string()))?;
    Ok((name, vendor, version))
}

fn parse_size(key: &str, value: &str) -> Result<u64, InstallError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| InstallError::with_detail(InstallErrorKind::InvalidValue, key))
}

fn cross_check_identity(
    descriptor: &PropertyStore,
    manifest: &PropertyStore,
) -> Result<(), InstallError> {
    for (key, kind) in [
        (MIDLET_NAME, InstallErrorKind::SuiteNameMismatch),
        (MIDLET_VENDOR, InstallErrorKind::VendorMismatch),
        (MIDLET_VERSION, InstallErrorKind::VersionMismatch),
    ] {
        let in_descriptor = descriptor.get(key);
        let in_manifest = manifest.get(key);
        if in_descriptor != in_manifest {
            return Err(InstallError::with_detail(
                kind,
                format!(
                    "descriptor '{}', manifest '{}'",
                    in_descriptor.unwrap_or_default(),
                    in_manifest.unwrap_or_default()
                ),
            ));
        }
    }
    Ok(())
}

/// Keys present in both descriptor and manifest must agree.
fn check_attribute_consistency(
    descriptor: &PropertyStore,
    manifest: &PropertyStore,
) -> Result<(), InstallError> {
    for (key, value) in descriptor.iter() {
        if let Some(other) = manifest.get(key) {
            if other != value {
                error!(
                    "[PHASE: policy] [STEP: attributes] Descriptor and manifest disagree (key={})",
                    key
                );
                return Err(InstallError::with_detail(
                    InstallErrorKind::AttributeMismatch,
                    key,
                ));
            }
        }
    }
    Ok(())
}
