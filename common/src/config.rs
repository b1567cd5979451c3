use std::{env, path::PathBuf};

/// Listen port used by the accept role when none is given
pub const DEFAULT_PORT: u16 = 4433;

/// Workload API socket of a locally running SPIRE agent
pub const DEFAULT_WORKLOAD_SOCKET: &str = "unix:///tmp/spire-agent/public/api.sock";

/// Hybrid (classical + post-quantum) key-exchange group offered to the peer
pub const DEFAULT_KEX_GROUP: &str = "p521_kyber1024";

/// Placeholder shown until the peer's certificate identity is known
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Label printed next to lines typed by the local operator
pub const DEFAULT_LOCAL_LABEL: &str = "You";

/// File name of the persisted private key
pub const PRIVATE_KEY_FILE: &str = "private_key.pem";

/// File name of the persisted certificate
pub const CERTIFICATE_FILE: &str = "certificate.pem";

const CERTS_DIR_ENV: &str = "PQCHAT_CERTS_DIR";
const CA_FILE_ENV: &str = "PQCHAT_CA_FILE";
const WORKLOAD_SOCKET_ENV: &str = "PQCHAT_WORKLOAD_SOCKET";
const OPENSSL_BIN_ENV: &str = "PQCHAT_OPENSSL_BIN";
const KEX_GROUP_ENV: &str = "PQCHAT_KEX_GROUP";
const PROVIDER_ENV: &str = "PQCHAT_OPENSSL_PROVIDER";

const DEFAULT_CERTS_DIR: &str = ".";
const DEFAULT_CA_FILE: &str = "../ca/ca_cert.pem";
const DEFAULT_OPENSSL_BIN: &str = "openssl";

fn get_certs_dir() -> PathBuf {
    let dir = env::var(CERTS_DIR_ENV).unwrap_or(DEFAULT_CERTS_DIR.to_string());
    PathBuf::from(dir)
}

/// Workload API address, `PQCHAT_WORKLOAD_SOCKET` or the SPIRE default
pub fn workload_socket() -> String {
    env::var(WORKLOAD_SOCKET_ENV).unwrap_or(DEFAULT_WORKLOAD_SOCKET.to_string())
}

/// OpenSSL binary used for the transport endpoint
pub fn openssl_program() -> PathBuf {
    env::var(OPENSSL_BIN_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_OPENSSL_BIN))
}

/// Key-exchange group, `PQCHAT_KEX_GROUP` or [`DEFAULT_KEX_GROUP`]
pub fn kex_group() -> String {
    env::var(KEX_GROUP_ENV).unwrap_or(DEFAULT_KEX_GROUP.to_string())
}

/// Extra OpenSSL provider (e.g. `oqsprovider`) to load, if configured
pub fn openssl_provider() -> Option<String> {
    env::var(PROVIDER_ENV).ok().filter(|p| !p.trim().is_empty())
}

/// Locations of the credentials handed to the transport endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPaths {
    /// Path to the local certificate file
    pub cert_path: PathBuf,
    /// Path to the local private key file
    pub key_path:  PathBuf,
    /// Path to the trust anchor used to verify the peer
    pub ca_path:   PathBuf,
}

impl CredentialPaths {
    /// Creates CredentialPaths with default locations.
    /// The key and certificate live in the credentials directory; the CA file
    /// is resolved on its own so several workloads can share one trust anchor.
    pub fn new() -> Self {
        let base = get_certs_dir();
        let ca_path = env::var(CA_FILE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CA_FILE));
        Self {
            cert_path: base.join(CERTIFICATE_FILE),
            key_path:  base.join(PRIVATE_KEY_FILE),
            ca_path,
        }
    }

    /// Paths rooted in `dir` for the key and certificate, keeping `ca_path`
    pub fn in_dir<D: Into<PathBuf>, C: Into<PathBuf>>(dir: D, ca_path: C) -> Self {
        let base = dir.into();
        Self {
            cert_path: base.join(CERTIFICATE_FILE),
            key_path:  base.join(PRIVATE_KEY_FILE),
            ca_path:   ca_path.into(),
        }
    }

    /// Replace the trust anchor path
    pub fn with_ca_path<P: Into<PathBuf>>(mut self, ca_path: P) -> Self {
        self.ca_path = ca_path.into();
        self
    }
}

impl Default for CredentialPaths {
    fn default() -> Self {
        Self::new()
    }
}

/// How the peer identity is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtractionMode {
    /// Scan the diagnostic output of the interactive session itself
    #[default]
    Live,
    /// Run a dedicated certificate-inspection handshake before the session
    Probe,
}

/// Which matches are allowed to change the peer identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdatePolicy {
    /// Keep the first extracted identity for the rest of the session
    #[default]
    FirstMatch,
    /// Every matching line replaces the identity
    EveryMatch,
}
