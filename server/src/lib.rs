//! pqchat Server Library
//!
//! Command line surface of the accept role. The binary parses [`ServerArgs`]
//! and hands the resulting [`SessionConfig`] to
//! [`pqchat_common::session::run`].

use std::path::PathBuf;

use clap::Parser;
pub use pqchat_common::{ExtractionMode, SessionConfig, UpdatePolicy};
use pqchat_common::{config, CredentialPaths, Role, DEFAULT_PORT};

#[derive(Parser, Debug, Clone)]
#[command(name = "pqchat-server")]
#[command(about = "Post-quantum mTLS chat server")]
pub struct ServerArgs {
    /// Port to accept connections on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Exit after the first connection instead of accepting more
    #[arg(long)]
    pub once: bool,

    /// Trust anchor used to verify clients
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

    /// Let every certificate subject seen replace the peer identity
    #[arg(long)]
    pub every_match: bool,

    /// Label for your own lines
    #[arg(long, default_value = config::DEFAULT_LOCAL_LABEL)]
    pub label: String,

    #[arg(short, long, default_value = "info")]
    pub log_level: String,
}

impl ServerArgs {
    /// Session configuration described by these arguments.
    ///
    /// The accept role cannot probe, so the peer identity always comes from
    /// live extraction.
    pub fn session_config(&self) -> SessionConfig {
        let mut paths = match &self.certs_dir {
            Some(dir) => CredentialPaths::in_dir(dir, CredentialPaths::new().ca_path),
            None => CredentialPaths::new(),
        };
        if let Some(ca) = &self.ca {
            paths = paths.with_ca_path(ca);
        }

        let mut session = SessionConfig::new(Role::Accept { port: self.port })
            .with_paths(paths)
            .with_local_label(self.label.clone())
            .with_extraction(ExtractionMode::Live)
            .with_accept_limit(self.once.then_some(1))
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
