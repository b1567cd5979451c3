//! pqchat Common Library
//!
//! Session lifecycle shared by the pqchat client and server. A session
//!
//! - provisions short-lived credentials from the SPIFFE Workload API,
//! - runs `openssl s_client` / `s_server` as the mutually authenticated,
//!   post-quantum transport endpoint,
//! - scrapes the peer certificate's Common Name from the endpoint output,
//! - relays chat lines between the endpoint and the local terminal.
//!
//! # Features
//!
//! - **Hybrid key exchange**: TLS 1.3 pinned to a classical + Kyber group
//! - **Mutual TLS**: both sides present workload certificates
//! - **Pluggable transport**: the relay only depends on [`SecureChannel`]

/// Configuration constants and environment defaults
pub mod config;

/// Error types
pub mod error;

/// Workload credential provisioning
pub mod identity;

/// Transport abstraction used by the relay
pub mod channel;

/// OpenSSL endpoint supervision
pub mod tunnel;

/// Peer identity extraction
pub mod extract;

/// Line relay between the transport and the terminal
pub mod relay;

/// Session orchestration
pub mod session;

// Re-export commonly used types for convenience
pub use channel::{SecureChannel, TerminationCause, Terminator};
pub use config::{CredentialPaths, ExtractionMode, UpdatePolicy, DEFAULT_PORT};
pub use error::{ProvisioningError, SessionError, TunnelError};
pub use session::{SessionConfig, SessionReport};
pub use tunnel::{Role, TunnelProcess, TunnelSpec};
