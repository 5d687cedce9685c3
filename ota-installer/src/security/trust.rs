// Archive signature strategies.

use crate::config::TrustedSignerConfig;
use crate::error::{InstallError, InstallErrorKind};
use crate::properties::{PropertyStore, MIDLET_JAR_RSA_SHA1};
use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, info, warn};
use ring::signature::{UnparsedPublicKey, RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Who signed a suite and which security domain that binds it to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerIdentity {
    pub auth_path: Vec<String>,
    pub domain: String,
}

/// Decides whether an archive is signed, and by whom. `Ok(None)` means unsigned.
#[async_trait]
pub trait ArchiveTrustVerifier: Send + Sync {
    async fn verify(
        &self,
        archive_path: &Path,
        descriptor: Option<&PropertyStore>,
    ) -> Result<Option<SignerIdentity>, InstallError>;
}

/// Treats every suite as unsigned.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSignatureVerifier;

#[async_trait]
impl ArchiveTrustVerifier for NoSignatureVerifier {
    async fn verify(
        &self,
        _archive_path: &Path,
        _descriptor: Option<&PropertyStore>,
    ) -> Result<Option<SignerIdentity>, InstallError> {
        Ok(None)
    }
}

#[derive(Debug, Clone)]
struct PinnedSigner {
    name: String,
    domain: String,
    /// PKCS#1 `RSAPublicKey`, DER.
    public_key: Vec<u8>,
}

/// Verifies the descriptor's `MIDlet-Jar-RSA-SHA1` signature over the archive bytes against a
/// fixed list of signer keys.
#[derive(Debug, Clone)]
pub struct PinnedSignerVerifier {
    signers: Vec<PinnedSigner>,
}

impl PinnedSignerVerifier {
    pub fn from_config(signers: &[TrustedSignerConfig]) -> anyhow::Result<Self> {
        let signers = signers
            .iter()
            .map(|s| {
                let public_key = STANDARD
                    .decode(s.public_key.trim())
                    .with_context(|| format!("Signer '{}' public key is not valid base64", s.name))?;
                Ok(PinnedSigner {
                    name: s.name.clone(),
                    domain: s.domain.clone(),
                    public_key,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        info!(
            "[PHASE: policy] [STEP: trust] Pinned signer verifier ready (signers={})",
            signers.len()
        );
        Ok(Self { signers })
    }
}

#[async_trait]
impl ArchiveTrustVerifier for PinnedSignerVerifier {
    async fn verify(
        &self,
        archive_path: &Path,
        descriptor: Option<&PropertyStore>,
    ) -> Result<Option<SignerIdentity>, InstallError> {
        let Some(encoded) = descriptor.and_then(|d| d.get_non_empty(MIDLET_JAR_RSA_SHA1)) else {
            debug!("[PHASE: policy] [STEP: trust] No archive signature; suite is unsigned");
            return Ok(None);
        };

        let signature = STANDARD.decode(encoded).map_err(|_| {
            InstallError::with_detail(
                InstallErrorKind::AuthenticationFailure,
                format!("{} is not valid base64", MIDLET_JAR_RSA_SHA1),
            )
        })?;
        let archive = tokio::fs::read(archive_path).await?;

        for signer in &self.signers {
            let key = UnparsedPublicKey::new(&RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY, &signer.public_key);
            if key.verify(&archive, &signature).is_ok() {
                info!(
                    "[PHASE: policy] [STEP: trust] Archive signature verified (signer={}, domain={})",
                    signer.name, signer.domain
                );
                return Ok(Some(SignerIdentity {
                    auth_path: vec![signer.name.clone()],
                    domain: signer.domain.clone(),
                }));
            }
        }

        warn!(
            "[PHASE: policy] [STEP: trust] Archive signature matches no trusted signer (signers={})",
            self.signers.len()
        );
        Err(InstallError::with_detail(
            InstallErrorKind::AuthenticationFailure,
            "no trusted signer matches the archive signature",
        ))
    }
}
