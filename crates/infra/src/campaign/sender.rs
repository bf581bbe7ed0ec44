//! Resolution of the From identity and signing key of a campaign.

use std::sync::Arc;

use lettre::message::dkim::{
    DkimCanonicalization, DkimCanonicalizationType, DkimConfig, DkimSigningAlgorithm,
    DkimSigningKey,
};
use lettre::message::header::HeaderName;
use rsa::RsaPrivateKey;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, LineEnding};
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use thiserror::Error;
use tracing::{debug, warn};

use mailforge_core::Campaign;

use crate::mail;
use crate::store::{DomainStore, StoreResult};

const MIN_KEY_BITS: usize = 1024;

/// Headers covered by the signature. lettre always emits all of them.
const SIGNED_HEADERS: [&str; 6] = ["From", "To", "Subject", "Date", "MIME-Version", "Content-Type"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DkimError {
    #[error("invalid DKIM private key: {0}")]
    InvalidKey(String),

    #[error("DKIM key too short: {0} bits")]
    KeyTooShort(usize),
}

/// rsa-sha256 relaxed/relaxed signing setup of a verified sending domain.
#[derive(Clone)]
pub struct DkimKey {
    pub domain: String,
    pub selector: String,
    config: Arc<DkimConfig>,
}

impl DkimKey {
    /// Accepts PKCS#8 or PKCS#1 PEM; lettre itself only reads PKCS#1.
    pub fn new(domain: &str, selector: &str, private_key_pem: &str) -> Result<Self, DkimError> {
        let key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(private_key_pem))
            .map_err(|e| DkimError::InvalidKey(e.to_string()))?;
        let bits = key.size() * 8;
        if bits < MIN_KEY_BITS {
            return Err(DkimError::KeyTooShort(bits));
        }
        let pkcs1 = key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| DkimError::InvalidKey(e.to_string()))?;
        let signing_key = DkimSigningKey::new(&pkcs1, DkimSigningAlgorithm::Rsa)
            .map_err(|e| DkimError::InvalidKey(e.to_string()))?;

        let config = DkimConfig::new(
            selector.to_string(),
            domain.to_string(),
            signing_key,
            SIGNED_HEADERS
                .into_iter()
                .map(HeaderName::new_from_ascii_str)
                .collect(),
            DkimCanonicalization {
                header: DkimCanonicalizationType::Relaxed,
                body: DkimCanonicalizationType::Relaxed,
            },
        );
        Ok(Self {
            domain: domain.to_string(),
            selector: selector.to_string(),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &DkimConfig {
        &self.config
    }
}

impl PartialEq for DkimKey {
    fn eq(&self, other: &Self) -> bool {
        self.domain == other.domain && self.selector == other.selector
    }
}

impl Eq for DkimKey {}

impl std::fmt::Debug for DkimKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DkimKey")
            .field("domain", &self.domain)
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningMode {
    Dkim(DkimKey),
    Unsigned,
    /// The domain is verified but its key is unusable; every send fails.
    Misconfigured(String),
}

/// Effective sender of a campaign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSender {
    pub from_email: String,
    pub from_name: Option<String>,
    pub signing: SigningMode,
}

/// A From domain verified for the company is kept and signed with its key.
/// Any other From address is moved onto `default_domain` and sent unsigned.
pub async fn resolve_sender<S: DomainStore + ?Sized>(
    store: &S,
    campaign: &Campaign,
    default_domain: &str,
) -> StoreResult<ResolvedSender> {
    let from_email = campaign.from_email.trim();

    if let Some(domain) = mail::domain_of(from_email) {
        if let Some(registered) = store
            .find_verified_domain(campaign.company_id, &domain)
            .await?
            .filter(|d| d.verified)
        {
            let signing = if registered.dkim_selector.trim().is_empty() {
                SigningMode::Misconfigured(format!("domain {domain} has no DKIM selector"))
            } else {
                match DkimKey::new(
                    &domain,
                    registered.dkim_selector.trim(),
                    &registered.dkim_private_key,
                ) {
                    Ok(key) => SigningMode::Dkim(key),
                    Err(e) => SigningMode::Misconfigured(format!("domain {domain}: {e}")),
                }
            };
            if let SigningMode::Misconfigured(reason) = &signing {
                warn!(campaign_id = %campaign.id, %reason, "verified sending domain cannot sign");
            }
            return Ok(ResolvedSender {
                from_email: from_email.to_string(),
                from_name: campaign.from_name.clone(),
                signing,
            });
        }
    }

    let local = from_email
        .rsplit_once('@')
        .map(|(local, _)| local)
        .filter(|local| !local.is_empty())
        .unwrap_or("noreply");
    let rewritten = format!("{local}@{default_domain}");
    debug!(
        campaign_id = %campaign.id,
        original = %from_email,
        from = %rewritten,
        "sending from platform domain"
    );

    Ok(ResolvedSender {
        from_email: rewritten,
        from_name: campaign.from_name.clone(),
        signing: SigningMode::Unsigned,
    })
}
