//! Session orchestration.
//!
//! A session provisions credentials, optionally probes the peer, starts the
//! transport endpoint and relays chat lines until both relay directions and
//! the endpoint have finished. The first fatal failure is returned; everything
//! else ends up in the [`SessionReport`].

use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::{
    channel::{read_line, SecureChannel, TerminationCause, Terminator},
    config::{self, CredentialPaths, ExtractionMode, UpdatePolicy, DEFAULT_LOCAL_LABEL},
    error::SessionError,
    extract::{IdentityExtractor, IdentitySlot},
    identity::provision,
    relay::{Relay, RelayReport},
    tunnel::{Role, TunnelProcess, TunnelSpec},
};

/// Configuration for one chat session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Connect or accept
    pub role:            Role,
    /// Credential and trust anchor files
    pub paths:           CredentialPaths,
    /// Workload API address; `None` reuses the credential files on disk
    pub workload_socket: Option<String>,
    /// Key-exchange group offered to the peer
    pub group:           String,
    /// Extra OpenSSL provider to load
    pub provider:        Option<String>,
    /// OpenSSL binary
    pub program:         PathBuf,
    /// Stop accepting after this many connections (accept role)
    pub accept_limit:    Option<u32>,
    /// Where the peer identity comes from
    pub extraction:      ExtractionMode,
    /// Which extracted identity wins
    pub policy:          UpdatePolicy,
    /// Label for the operator's own lines
    pub local_label:     String,
    /// Print the welcome text
    pub banner:          bool,
}

impl SessionConfig {
    /// Defaults for `role`, taken from the environment where configured
    pub fn new(role: Role) -> Self {
        Self {
            role,
            paths: CredentialPaths::new(),
            workload_socket: Some(config::workload_socket()),
            group: config::kex_group(),
            provider: config::openssl_provider(),
            program: config::openssl_program(),
            accept_limit: None,
            extraction: ExtractionMode::default(),
            policy: UpdatePolicy::default(),
            local_label: DEFAULT_LOCAL_LABEL.to_string(),
            banner: true,
        }
    }

    /// Set the credential paths
    pub fn with_paths(mut self, paths: CredentialPaths) -> Self {
        self.paths = paths;
        self
    }

    /// Set the Workload API address, or `None` to skip provisioning
    pub fn with_workload_socket(mut self, address: Option<String>) -> Self {
        self.workload_socket = address;
        self
    }

    /// Set the key-exchange group
    pub fn with_group<S: Into<String>>(mut self, group: S) -> Self {
        self.group = group.into();
        self
    }

    /// Set the OpenSSL provider
    pub fn with_provider(mut self, provider: Option<String>) -> Self {
        self.provider = provider;
        self
    }

    /// Set the OpenSSL binary
    pub fn with_program<P: Into<PathBuf>>(mut self, program: P) -> Self {
        self.program = program.into();
        self
    }

    /// Limit the number of accepted connections
    pub fn with_accept_limit(mut self, limit: Option<u32>) -> Self {
        self.accept_limit = limit;
        self
    }

    /// Set the extraction mode
    pub fn with_extraction(mut self, mode: ExtractionMode) -> Self {
        self.extraction = mode;
        self
    }

    /// Set the identity update policy
    pub fn with_update_policy(mut self, policy: UpdatePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the local label
    pub fn with_local_label<S: Into<String>>(mut self, label: S) -> Self {
        self.local_label = label.into();
        self
    }

    /// Show or hide the welcome text
    pub fn with_banner(mut self, banner: bool) -> Self {
        self.banner = banner;
        self
    }

    /// Transport endpoint description for this session
    pub fn tunnel_spec(&self) -> TunnelSpec {
        TunnelSpec::new(self.role.clone(), self.paths.clone())
            .with_group(self.group.clone())
            .with_provider(self.provider.clone())
            .with_program(self.program.clone())
            .with_accept_limit(self.accept_limit)
    }
}

/// Summary of a finished session
#[derive(Debug)]
pub struct SessionReport {
    /// Session id, also attached to every log line of the session
    pub id:            Uuid,
    /// Peer identity at the end of the session
    pub peer_identity: Option<String>,
    /// How the relay ended
    pub relay:         RelayReport,
    /// First termination cause
    pub cause:         Option<TerminationCause>,
    /// Exit code of the transport, `None` when it was killed
    pub exit_code:     Option<i32>,
}

/// Run a whole session against the operator's terminal
pub async fn run(config: &SessionConfig) -> Result<SessionReport, SessionError> {
    let id = Uuid::new_v4();
    let span = info_span!("session", %id, role = %config.role);
    establish(config, id).instrument(span).await
}

async fn establish(config: &SessionConfig, id: Uuid) -> Result<SessionReport, SessionError> {
    match &config.workload_socket {
        Some(address) => {
            provision(address, &config.paths).await?;
        }
        None => info!(cert = ?config.paths.cert_path, "Using existing credentials"),
    }

    let spec = config.tunnel_spec();
    let slot = IdentitySlot::new();
    if config.extraction == ExtractionMode::Probe {
        IdentityExtractor::new(slot.clone(), config.policy)
            .probe(&spec)
            .await?;
    }
    let live = uses_live_extraction(config.extraction, &spec);

    let channel = TunnelProcess::start(&spec)?;
    let interrupt = tokio::spawn(interrupt_on_ctrl_c(channel.terminator()));
    let result = run_with_channel(
        config,
        id,
        channel,
        slot,
        live,
        tokio::io::stdin(),
        tokio::io::stdout(),
    )
    .await;
    interrupt.abort();
    result
}

/// Whether the interactive session has to extract the peer identity itself.
/// The accept role cannot probe and falls back to live extraction.
fn uses_live_extraction(mode: ExtractionMode, spec: &TunnelSpec) -> bool {
    match mode {
        ExtractionMode::Live => true,
        ExtractionMode::Probe => spec.probe_args().is_none(),
    }
}

/// Whether the transport got as far as a session with the peer: a
/// certificate subject was seen live or data arrived.
fn peer_reached(relay: &RelayReport, live_identity: bool) -> bool {
    live_identity || relay.lines_received > 0
}

async fn interrupt_on_ctrl_c(terminator: Terminator) {
    tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => {
                terminator.terminate(TerminationCause::Interrupted);
            }
            Err(e) => warn!(error = %e, "Cannot listen for Ctrl+C"),
        },
        () = terminator.terminated() => {}
    }
}

/// Relay one session over an already established `channel`.
///
/// With `live` extraction the diagnostic stream and the inbound data feed
/// `slot`; otherwise the diagnostic stream is only logged.
pub async fn run_with_channel<C, LI, LO>(
    config: &SessionConfig,
    id: Uuid,
    mut channel: C,
    slot: IdentitySlot,
    live: bool,
    local_in: LI,
    local_out: LO,
) -> Result<SessionReport, SessionError>
where
    C: SecureChannel,
    LI: AsyncRead + Unpin,
    LO: AsyncWrite + Unpin,
{
    let (reader, writer) = channel.split()?;
    let terminator = channel.terminator();
    let extractor = IdentityExtractor::new(slot.clone(), config.policy);

    let diagnostics = channel.take_diagnostics().map(|stream| {
        let extractor = extractor.clone();
        tokio::spawn(async move {
            if live {
                extractor.run(stream).await
            } else {
                drain_diagnostics(stream).await;
                0
            }
        })
    });

    let mut relay = Relay::new(slot.clone(), terminator)
        .with_local_label(config.local_label.clone())
        .with_banner(config.banner);
    if live {
        relay = relay.with_identity_tap(extractor);
    }
    let relay_report = relay.run(reader, writer, local_in, local_out).await;

    let exit = channel.closed().await?;
    if let Some(task) = diagnostics {
        match task.await {
            Ok(applied) => debug!(applied, "Identity extraction finished"),
            Err(e) => warn!(error = %e, "Identity extraction task failed"),
        }
    }

    if exit.is_unrequested_failure() {
        // OpenSSL exits non-zero when the peer drops the connection, which is
        // how a remote `exit` looks from here.
        if peer_reached(&relay_report, live && slot.get().is_some()) {
            warn!(code = ?exit.code, cause = ?exit.cause, "Transport exited with an error after the peer left");
        } else {
            error!(code = ?exit.code, cause = ?exit.cause, "Transport failed before reaching the peer");
            return Err(SessionError::TunnelFailed { code: exit.code });
        }
    }

    let report = SessionReport {
        id,
        peer_identity: slot.get(),
        relay: relay_report,
        cause: exit.cause,
        exit_code: exit.code,
    };
    info!(
        peer = report.peer_identity.as_deref().unwrap_or(config::UNKNOWN_IDENTITY),
        cause = ?report.cause,
        code = ?report.exit_code,
        "Session finished"
    );
    Ok(report)
}

/// Log the diagnostic stream without extracting from it. The stream still
/// has to be read or the endpoint blocks on a full pipe.
async fn drain_diagnostics<R>(stream: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        match read_line(&mut reader, &mut line).await {
            Ok(0) => break,
            Ok(_) => trace!(target: "pqchat::diagnostics", line = %line.trim_end()),
            Err(e) => {
                debug!(error = %e, "Diagnostic stream failed");
                break;
            }
        }
    }
}
