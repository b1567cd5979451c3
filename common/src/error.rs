//! Error types for the session lifecycle.

use std::{io, path::PathBuf};

use thiserror::Error;

/// Failures while obtaining or persisting the workload credentials
#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// The workload identity source could not be reached
    #[error("workload identity source unavailable at {address}: {reason}")]
    SourceUnavailable {
        /// Address that was dialled
        address: String,
        /// Underlying client error
        reason:  String,
    },

    /// The source answered but no X.509 identity could be fetched
    #[error("failed to fetch X.509 identity: {0}")]
    Fetch(String),

    /// The identity document does not follow the expected layout
    #[error("malformed identity: {0}")]
    Malformed(String),

    /// Writing one of the credential files failed
    #[error("failed to persist {path:?}: {source}")]
    Persist {
        /// File being written
        path:   PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },
}

/// Failures of the transport endpoint process
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The process could not be started
    #[error("failed to launch {program}: {source}")]
    Launch {
        /// Program that was executed
        program: String,
        /// Underlying spawn error
        #[source]
        source:  io::Error,
    },

    /// A standard stream was not available for wiring
    #[error("failed to wire transport {0}")]
    IoSetup(&'static str),

    /// Waiting for the process failed
    #[error("failed to wait for transport process: {0}")]
    Wait(#[source] io::Error),
}

/// Fatal outcome of a whole session
#[derive(Debug, Error)]
pub enum SessionError {
    /// Credentials could not be provisioned; the transport never started
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    /// The transport could not be launched or wired
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    /// The pre-connection identity probe failed
    #[error("identity probe failed: {0}")]
    Probe(String),

    /// The transport ended with a failure the operator did not ask for
    #[error("transport exited with status {code:?}")]
    TunnelFailed {
        /// Exit code, `None` when killed by a signal
        code: Option<i32>,
    },
}
