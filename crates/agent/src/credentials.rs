//! Trust material for this agent: a self-signed CA, a leaf certificate
//! signed by it, and the single-use invite token.
//!
//! The CA certificate is what peers exchange and pin during the handshake;
//! the leaf can be rotated independently without re-peering. Everything is
//! generated lazily on first boot and persisted to the sensitive blob.

use std::sync::Arc;

use rand::Rng;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::info;

use crate::persist::{PersistError, SensitiveHandle};

const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;
const TOKEN_LEN: usize = 48;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("certificate generation failed: {0}")]
    Generate(#[source] anyhow::Error),
    #[error("credential store unreadable or unwritable: {0}")]
    Persist(#[from] PersistError),
}

/// Compute the canonical fingerprint of a PEM certificate: SHA-256 over the
/// DER encoding, lowercase hex with colons. Whitespace differences in the
/// PEM never change the fingerprint.
pub fn fingerprint_pem(cert_pem: &str) -> anyhow::Result<String> {
    let parsed = pem::parse(cert_pem)?;
    Ok(fingerprint_der(parsed.contents()))
}

fn fingerprint_der(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Generate a random invite token, URL-safe, well over 128 bits of entropy.
pub fn generate_token() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..TOKEN_LEN)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

struct GeneratedCredentials {
    ca_pem: String,
    ca_key: String,
    leaf_pem: String,
    leaf_key: String,
}

fn validity(days: i64) -> (time::OffsetDateTime, time::OffsetDateTime) {
    let not_before = time::OffsetDateTime::now_utc();
    (not_before, not_before + time::Duration::days(days))
}

fn generate_credentials(agent_name: &str) -> Result<GeneratedCredentials, CredentialError> {
    let map_err = |err: rcgen::Error| CredentialError::Generate(err.into());

    let ca_key = KeyPair::generate().map_err(map_err)?;
    let mut ca_params = CertificateParams::default();
    ca_params
        .distinguished_name
        .push(DnType::CommonName, format!("{agent_name}-ca"));
    ca_params
        .distinguished_name
        .push(DnType::OrganizationName, "porpulsion");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    ca_params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    (ca_params.not_before, ca_params.not_after) = validity(CA_VALIDITY_DAYS);
    let ca_cert = ca_params.self_signed(&ca_key).map_err(map_err)?;

    let leaf_key = KeyPair::generate().map_err(map_err)?;
    let mut leaf_params =
        CertificateParams::new(vec![agent_name.to_string()]).map_err(map_err)?;
    leaf_params
        .distinguished_name
        .push(DnType::CommonName, agent_name);
    leaf_params
        .distinguished_name
        .push(DnType::OrganizationName, "porpulsion");
    (leaf_params.not_before, leaf_params.not_after) = validity(LEAF_VALIDITY_DAYS);
    let leaf_cert = leaf_params
        .signed_by(&leaf_key, &ca_cert, &ca_key)
        .map_err(map_err)?;

    Ok(GeneratedCredentials {
        ca_pem: ca_cert.pem(),
        ca_key: ca_key.serialize_pem(),
        leaf_pem: leaf_cert.pem(),
        leaf_key: leaf_key.serialize_pem(),
    })
}

/// Loaded-or-generated trust material plus the invite token.
pub struct CredentialStore {
    ca_pem: String,
    ca_fingerprint: String,
    leaf_pem: String,
    sensitive: Arc<SensitiveHandle>,
    /// Guards compare + rotate so a token is redeemed at most once.
    token: Mutex<String>,
}

impl CredentialStore {
    /// Load credentials from the sensitive blob, generating and persisting
    /// anything that is missing.
    pub async fn open(
        agent_name: &str,
        sensitive: Arc<SensitiveHandle>,
    ) -> Result<Self, CredentialError> {
        let blob = sensitive.snapshot().await;

        let (ca_pem, leaf_pem) = if blob.has_credentials() {
            (blob.ca_pem.clone(), blob.leaf_pem.clone())
        } else {
            info!(agent = agent_name, "generating CA and leaf certificates");
            let generated = generate_credentials(agent_name)?;
            let (ca, leaf) = (generated.ca_pem.clone(), generated.leaf_pem.clone());
            sensitive
                .update(move |blob| {
                    blob.ca_pem = generated.ca_pem;
                    blob.ca_key = generated.ca_key;
                    blob.leaf_pem = generated.leaf_pem;
                    blob.leaf_key = generated.leaf_key;
                })
                .await?;
            (ca, leaf)
        };

        let token = if blob.invite_token.is_empty() {
            let fresh = generate_token();
            let for_blob = fresh.clone();
            sensitive
                .update(move |blob| blob.invite_token = for_blob)
                .await?;
            fresh
        } else {
            blob.invite_token
        };

        let ca_fingerprint = fingerprint_pem(&ca_pem).map_err(CredentialError::Generate)?;

        Ok(Self {
            ca_pem,
            ca_fingerprint,
            leaf_pem,
            sensitive,
            token: Mutex::new(token),
        })
    }

    pub fn ca_pem(&self) -> &str {
        &self.ca_pem
    }

    pub fn fingerprint(&self) -> &str {
        &self.ca_fingerprint
    }

    pub fn leaf_pem(&self) -> &str {
        &self.leaf_pem
    }

    pub async fn current_invite_token(&self) -> String {
        self.token.lock().await.clone()
    }

    /// Replace the invite token, persisting before the swap becomes visible.
    pub async fn rotate_invite_token(&self) -> Result<String, CredentialError> {
        let mut guard = self.token.lock().await;
        let fresh = generate_token();
        let for_blob = fresh.clone();
        self.sensitive
            .update(move |blob| blob.invite_token = for_blob)
            .await?;
        *guard = fresh.clone();
        Ok(fresh)
    }

    /// Redeem an invite token. Constant-time compare; on success the token is
    /// rotated before this returns, so a second redemption of the same value
    /// fails.
    pub async fn redeem(&self, presented: &str) -> Result<(), RedeemError> {
        let mut guard = self.token.lock().await;
        let matches = presented.len() == guard.len()
            && bool::from(presented.as_bytes().ct_eq(guard.as_bytes()));
        if !matches {
            return Err(RedeemError::Invalid);
        }

        let fresh = generate_token();
        let for_blob = fresh.clone();
        self.sensitive
            .update(move |blob| blob.invite_token = for_blob)
            .await
            .map_err(|err| RedeemError::Persist(err.into()))?;
        *guard = fresh;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RedeemError {
    #[error("invite token invalid")]
    Invalid,
    #[error("could not rotate invite token: {0}")]
    Persist(#[source] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{BlobHandle, MemoryBlobStore};

    async fn open_store() -> (CredentialStore, Arc<SensitiveHandle>) {
        let handle = Arc::new(
            BlobHandle::open(MemoryBlobStore::shared())
                .await
                .expect("open blob"),
        );
        let store = CredentialStore::open("agent-a", handle.clone())
            .await
            .expect("open credentials");
        (store, handle)
    }

    #[tokio::test]
    async fn generates_and_persists_on_first_boot() {
        let (store, handle) = open_store().await;
        assert!(store.ca_pem().contains("BEGIN CERTIFICATE"));
        assert!(store.leaf_pem().contains("BEGIN CERTIFICATE"));

        let blob = handle.snapshot().await;
        assert!(blob.has_credentials());
        assert_eq!(blob.ca_pem, store.ca_pem());
        assert_eq!(blob.invite_token.len(), TOKEN_LEN);
    }

    #[tokio::test]
    async fn reload_preserves_ca_and_fingerprint() {
        let (store, handle) = open_store().await;
        let fingerprint = store.fingerprint().to_string();

        let reopened = CredentialStore::open("agent-a", handle)
            .await
            .expect("reopen");
        assert_eq!(reopened.fingerprint(), fingerprint);
        assert_eq!(reopened.ca_pem(), store.ca_pem());
    }

    #[tokio::test]
    async fn redeem_consumes_exactly_once() {
        let (store, _) = open_store().await;
        let token = store.current_invite_token().await;

        store.redeem(&token).await.expect("first redeem succeeds");
        let err = store.redeem(&token).await.expect_err("second must fail");
        assert!(matches!(err, RedeemError::Invalid));

        // The rotated token is live.
        let next = store.current_invite_token().await;
        assert_ne!(next, token);
        store.redeem(&next).await.expect("rotated token redeems");
    }

    #[tokio::test]
    async fn redeem_rejects_wrong_token_without_rotating() {
        let (store, _) = open_store().await;
        let before = store.current_invite_token().await;
        let err = store.redeem("not-the-token").await.expect_err("rejected");
        assert!(matches!(err, RedeemError::Invalid));
        assert_eq!(store.current_invite_token().await, before);
    }

    #[test]
    fn fingerprint_format_is_colon_separated_hex() {
        let generated = generate_credentials("agent-a").expect("generate");
        let fp = fingerprint_pem(&generated.ca_pem).expect("fingerprint");
        // 32 bytes -> 64 hex chars + 31 colons.
        assert_eq!(fp.len(), 95);
        assert!(fp
            .split(':')
            .all(|chunk| chunk.len() == 2 && chunk.chars().all(|c| c.is_ascii_hexdigit())));
        assert_eq!(fp, fp.to_lowercase());
    }

    #[test]
    fn fingerprint_ignores_pem_whitespace() {
        let generated = generate_credentials("agent-a").expect("generate");
        let padded = format!("\n{}\n\n", generated.ca_pem.trim());
        assert_eq!(
            fingerprint_pem(&generated.ca_pem).expect("fp"),
            fingerprint_pem(&padded).expect("fp padded")
        );
    }

    #[test]
    fn tokens_are_long_and_distinct() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), TOKEN_LEN);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
