//! pqchat Client Library
//!
//! Command line surface of the connect role. The binary parses [`ClientArgs`]
//! and hands the resulting [`SessionConfig`] to
//! [`pqchat_common::session::run`].
//!
//! # Example
//!
//! ```no_run
//! use clap::Parser;
//! use pqchat_client::ClientArgs;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let args = ClientArgs::parse_from(["pqchat-client", "peer.example.org:4433", "--probe"]);
//! let report = pqchat_common::session::run(&args.session_config()).await?;
//! println!("Talked to {:?}", report.peer_identity);
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;

use clap::Parser;
pub use pqchat_common::{ExtractionMode, SessionConfig, UpdatePolicy};
use pqchat_common::{config, CredentialPaths, Role};

/// Default peer when none is given
pub const DEFAULT_PEER: &str = "localhost:4433";

#[derive(Parser, Debug, Clone)]
#[command(name = "pqchat-client")]
#[command(about = "Post-quantum mTLS chat client")]
pub struct ClientArgs {
    /// Peer to connect to (host:port)
    #[arg(default_value = DEFAULT_PEER)]
    pub peer: String,

    /// Trust anchor used to verify the server
    #[arg(long)]
    pub ca: Option<PathBuf>,

    /// Directory for private_key.pem and certificate.pem
    #[arg(long)]
    pub certs_dir: Option<PathBuf>,

    /// Workload API address
    #[arg(long)]
    pub workload_socket: Option<String>,

    /// Reuse the credential files on disk instead of fetching new ones
    #[arg(long)]
    pub no_provision: bool,

    /// Key-exchange group
    #[arg(long)]
    pub group: Option<String>,

    /// Extra OpenSSL provider to load, e.g. oqsprovider
    #[arg(long)]
    pub provider: Option<String>,

    /// OpenSSL binary
    #[arg(long)]
    pub openssl: Option<PathBuf>,

    /// Inspect the server certificate before opening the chat
    #[arg(long)]
    pub probe: bool,

    /// Let every certificate subject seen replace the peer identity
    #[arg(long)]
    pub every_match: bool,

    /// Label for your own lines
    #[arg(long, default_value = config::DEFAULT_LOCAL_LABEL)]
    pub label: String,

    #[arg(short, long, default_value = "info")]
    pub log_level: String,
}

impl ClientArgs {
    /// Session configuration described by these arguments.
    ///
    /// Flags override the `PQCHAT_*` environment defaults.
    pub fn session_config(&self) -> SessionConfig {
        let mut paths = match &self.certs_dir {
            Some(dir) => CredentialPaths::in_dir(dir, CredentialPaths::new().ca_path),
            None => CredentialPaths::new(),
        };
        if let Some(ca) = &self.ca {
            paths = paths.with_ca_path(ca);
        }

        let mut session = SessionConfig::new(Role::Connect {
            peer: self.peer.clone(),
        })
        .with_paths(paths)
        .with_local_label(self.label.clone())
        .with_extraction(if self.probe {
            ExtractionMode::Probe
        } else {
            ExtractionMode::Live
        })
        .with_update_policy(if self.every_match {
            UpdatePolicy::EveryMatch
        } else {
            UpdatePolicy::FirstMatch
        });

        if self.no_provision {
            session = session.with_workload_socket(None);
        } else if let Some(address) = &self.workload_socket {
            session = session.with_workload_socket(Some(address.clone()));
        }
        if let Some(group) = &self.group {
            session = session.with_group(group.clone());
        }
        if self.provider.is_some() {
            session = session.with_provider(self.provider.clone());
        }
        if let Some(openssl) = &self.openssl {
            session = session.with_program(openssl.clone());
        }
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = ClientArgs::parse_from(["pqchat-client"]);
        let session = args.session_config();

        assert_eq!(
            session.role,
            Role::Connect {
                peer: DEFAULT_PEER.into()
            }
        );
        assert!(session.workload_socket.is_some());
        assert_eq!(session.extraction, ExtractionMode::Live);
        assert_eq!(session.policy, UpdatePolicy::FirstMatch);
        assert_eq!(session.local_label, "You");
    }

    #[test]
    fn test_flags_override() {
        let args = ClientArgs::parse_from([
            "pqchat-client",
            "chat.example.org:9000",
            "--certs-dir",
            "/run/pqchat",
            "--ca",
            "/etc/pqchat/ca.pem",
            "--no-provision",
            "--group",
            "x25519_kyber768",
            "--provider",
            "oqsprovider",
            "--openssl",
            "/opt/openssl/bin/openssl",
            "--probe",
            "--every-match",
            "--label",
            "Me",
        ]);
        let session = args.session_config();

        assert_eq!(
            session.role,
            Role::Connect {
                peer: "chat.example.org:9000".into()
            }
        );
        assert_eq!(session.paths.key_path, PathBuf::from("/run/pqchat/private_key.pem"));
        assert_eq!(session.paths.cert_path, PathBuf::from("/run/pqchat/certificate.pem"));
        assert_eq!(session.paths.ca_path, PathBuf::from("/etc/pqchat/ca.pem"));
        assert_eq!(session.workload_socket, None);
        assert_eq!(session.group, "x25519_kyber768");
        assert_eq!(session.provider.as_deref(), Some("oqsprovider"));
        assert_eq!(session.program, PathBuf::from("/opt/openssl/bin/openssl"));
        assert_eq!(session.extraction, ExtractionMode::Probe);
        assert_eq!(session.policy, UpdatePolicy::EveryMatch);
        assert_eq!(session.local_label, "Me");
    }

    #[test]
    fn test_workload_socket_flag() {
        let args = ClientArgs::parse_from([
            "pqchat-client",
            "--workload-socket",
            "unix:///run/spire/agent.sock",
        ]);
        assert_eq!(
            args.session_config().workload_socket.as_deref(),
            Some("unix:///run/spire/agent.sock")
        );
    }
}
