//! Workload identity provisioning.
//!
//! The identity source hands out an X.509-SVID whose leaf certificate carries,
//! in its **last** DNS-name SAN entry, a PEM private key immediately followed
//! by a PEM certificate. This is not an X.509 convention; the payload is
//! parsed strictly and any deviation is reported as
//! [`ProvisioningError::Malformed`] before anything touches the disk.

use std::{
    fmt,
    fs,
    future::Future,
    io::{self, BufReader, Write},
    path::Path,
};

use sha2::{Digest, Sha256};
use spiffe::workload_api::client::WorkloadApiClient;
use tracing::{debug, info, warn};
use x509_parser::prelude::*;

use crate::{config::CredentialPaths, error::ProvisioningError};

/// PEM trailer that terminates the private key inside the SAN payload
pub const PRIVATE_KEY_TRAILER: &str = "-----END PRIVATE KEY-----";

/// Private key and certificate recovered from the workload identity
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityBundle {
    private_key_pem: String,
    certificate_pem: String,
}

impl fmt::Debug for IdentityBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityBundle")
            .field("private_key_pem", &"<redacted>")
            .field("certificate_pem", &self.certificate_pem)
            .finish()
    }
}

impl IdentityBundle {
    /// Split a `key || certificate` payload right after the private key
    /// trailer.
    ///
    /// The trailer must occur exactly once and be followed by a non-empty
    /// certificate part; the two parts concatenate back to `payload`.
    pub fn split(payload: &str) -> Result<Self, ProvisioningError> {
        let start = payload.find(PRIVATE_KEY_TRAILER).ok_or_else(|| {
            ProvisioningError::Malformed(format!(
                "identity payload has no `{PRIVATE_KEY_TRAILER}` trailer"
            ))
        })?;
        let (private_key, certificate) = payload.split_at(start + PRIVATE_KEY_TRAILER.len());

        if certificate.is_empty() {
            return Err(ProvisioningError::Malformed(
                "no certificate follows the private key".to_string(),
            ));
        }
        if certificate.contains(PRIVATE_KEY_TRAILER) {
            return Err(ProvisioningError::Malformed(
                "private key trailer appears more than once".to_string(),
            ));
        }

        Ok(Self {
            private_key_pem: private_key.to_string(),
            certificate_pem: certificate.to_string(),
        })
    }

    /// Extract the bundle from a DER encoded leaf certificate
    pub fn from_leaf_der(der: &[u8]) -> Result<Self, ProvisioningError> {
        let names = dns_names(der)?;
        let payload = names.last().ok_or_else(|| {
            ProvisioningError::Malformed("leaf certificate has no DNS-name SAN entries".to_string())
        })?;
        debug!(entries = names.len(), "Using last DNS-name SAN entry as identity payload");
        Self::split(payload)
    }

    /// PEM text of the private key, ending with [`PRIVATE_KEY_TRAILER`]
    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    /// PEM text of the certificate
    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// Write the key (owner read/write only) and the certificate (default
    /// permissions), replacing any previous files
    pub fn persist(&self, paths: &CredentialPaths) -> Result<(), ProvisioningError> {
        write_private_key(&paths.key_path, &self.private_key_pem).map_err(|source| {
            ProvisioningError::Persist {
                path: paths.key_path.clone(),
                source,
            }
        })?;
        fs::write(&paths.cert_path, &self.certificate_pem).map_err(|source| {
            ProvisioningError::Persist {
                path: paths.cert_path.clone(),
                source,
            }
        })?;

        info!(
            key = ?paths.key_path,
            cert = ?paths.cert_path,
            "Persisted workload credentials"
        );
        Ok(())
    }

    /// Lowercase hex SHA-256 of the first certificate in the PEM text
    pub fn fingerprint(&self) -> Option<String> {
        let der = first_certificate_der(&self.certificate_pem)?;
        Some(hex::encode(Sha256::digest(&der)))
    }

    /// Common Name of the local certificate, if the PEM parses
    pub fn subject_common_name(&self) -> Option<String> {
        let der = first_certificate_der(&self.certificate_pem)?;
        let (_, cert) = parse_x509_certificate(&der).ok()?;
        // Bound to a local so the borrow of `cert` ends before it drops.
        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);
        cn
    }

    /// Whether the key part holds a private key PEM block that parses
    pub fn has_parsable_key(&self) -> bool {
        let mut reader = BufReader::new(self.private_key_pem.as_bytes());
        matches!(rustls_pemfile::private_key(&mut reader), Ok(Some(_)))
    }

    fn log_summary(&self) {
        match (self.subject_common_name(), self.fingerprint()) {
            (cn, Some(fingerprint)) => {
                info!(cn = cn.as_deref().unwrap_or("-"), %fingerprint, "Local identity ready")
            }
            (_, None) => warn!("Provisioned certificate does not contain a parsable PEM block"),
        }
        if !self.has_parsable_key() {
            warn!("Provisioned private key does not contain a parsable PEM block");
        }
    }
}

fn first_certificate_der(pem: &str) -> Option<Vec<u8>> {
    let mut reader = BufReader::new(pem.as_bytes());
    let der = rustls_pemfile::certs(&mut reader)
        .next()?
        .ok()
        .map(|der| der.as_ref().to_vec());
    der
}

fn dns_names(der: &[u8]) -> Result<Vec<String>, ProvisioningError> {
    let (_, cert) = parse_x509_certificate(der).map_err(|e| {
        ProvisioningError::Malformed(format!("leaf certificate does not parse: {e}"))
    })?;
    let san = cert.subject_alternative_name().map_err(|e| {
        ProvisioningError::Malformed(format!("invalid subject alternative names: {e}"))
    })?;

    let names = san
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(names)
}

fn write_private_key(path: &Path, contents: &str) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;

    // `mode` only applies on creation; narrow an existing file before writing.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(contents.as_bytes())?;
    file.flush()
}

/// A source of the workload's current leaf certificate
pub trait IdentitySource {
    /// Fetch the DER encoded leaf certificate of the workload's X.509 identity
    fn fetch_leaf_certificate(
        &self,
    ) -> impl Future<Output = Result<Vec<u8>, ProvisioningError>> + Send;
}

/// SPIFFE Workload API reached over a local domain socket
#[derive(Debug, Clone)]
pub struct WorkloadApiSource {
    address: String,
}

impl WorkloadApiSource {
    /// Source at `address`, e.g. `unix:///tmp/spire-agent/public/api.sock`
    pub fn new<S: Into<String>>(address: S) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// Address the source dials
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl IdentitySource for WorkloadApiSource {
    async fn fetch_leaf_certificate(&self) -> Result<Vec<u8>, ProvisioningError> {
        debug!(address = %self.address, "Connecting to workload API");
        let mut client = WorkloadApiClient::new_from_path(&self.address)
            .await
            .map_err(|e| ProvisioningError::SourceUnavailable {
                address: self.address.clone(),
                reason:  e.to_string(),
            })?;

        let svid = client
            .fetch_x509_svid()
            .await
            .map_err(|e| ProvisioningError::Fetch(e.to_string()))?;

        info!(spiffe_id = %svid.spiffe_id(), "Fetched X.509 SVID");
        Ok(svid.leaf().content().to_vec())
    }
}

/// Fetch the workload identity from `source` and persist it to `paths`.
///
/// Nothing is written unless the identity payload splits cleanly.
pub async fn fetch_and_persist<S: IdentitySource>(
    source: &S,
    paths: &CredentialPaths,
) -> Result<IdentityBundle, ProvisioningError> {
    let der = source.fetch_leaf_certificate().await?;
    let bundle = IdentityBundle::from_leaf_der(&der)?;
    bundle.persist(paths)?;
    bundle.log_summary();
    Ok(bundle)
}

/// [`fetch_and_persist`] against the Workload API at `address`
pub async fn provision(
    address: &str,
    paths: &CredentialPaths,
) -> Result<IdentityBundle, ProvisioningError> {
    fetch_and_persist(&WorkloadApiSource::new(address), paths).await
}
