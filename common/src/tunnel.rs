//! Supervision of the OpenSSL transport endpoint.
//!
//! The handshake and record protocol run inside `openssl s_client` /
//! `openssl s_server`. This module builds their command line, owns the child
//! process and hands its standard streams to the relay through
//! [`SecureChannel`].
//!
//! A watcher task owns the [`Child`] for its whole life so that
//! [`Terminator::terminate`] takes effect immediately, whichever task calls it.

use std::{
    ffi::{OsStr, OsString},
    fmt,
    io,
    path::{Path, PathBuf},
    process::{Output, Stdio},
    time::Duration,
};

use tokio::{
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    channel::{ChannelExit, SecureChannel, TerminationCause, Terminator},
    config::{self, CredentialPaths},
    error::TunnelError,
};

/// Time the endpoint gets to exit after SIGTERM before it is killed
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Which side of the handshake the endpoint plays
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Dial `peer` (`host:port`)
    Connect {
        /// Remote address
        peer: String,
    },
    /// Accept connections on `port`
    Accept {
        /// Local listen port
        port: u16,
    },
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Connect { peer } => write!(f, "connect {peer}"),
            Role::Accept { port } => write!(f, "accept :{port}"),
        }
    }
}

/// Everything needed to launch the transport endpoint
#[derive(Debug, Clone)]
pub struct TunnelSpec {
    /// Connect or accept
    pub role:         Role,
    /// Local credentials and trust anchor
    pub paths:        CredentialPaths,
    /// Hybrid key-exchange group name
    pub group:        String,
    /// Extra OpenSSL provider to load next to the default one
    pub provider:     Option<String>,
    /// OpenSSL binary
    pub program:      PathBuf,
    /// Connections the accept role serves before exiting; unlimited if `None`
    pub accept_limit: Option<u32>,
}

impl TunnelSpec {
    /// Spec for `role` with group, provider and binary taken from the
    /// environment defaults
    pub fn new(role: Role, paths: CredentialPaths) -> Self {
        Self {
            role,
            paths,
            group: config::kex_group(),
            provider: config::openssl_provider(),
            program: config::openssl_program(),
            accept_limit: None,
        }
    }

    /// Set the key-exchange group
    pub fn with_group<S: Into<String>>(mut self, group: S) -> Self {
        self.group = group.into();
        self
    }

    /// Set (or clear) the extra provider
    pub fn with_provider(mut self, provider: Option<String>) -> Self {
        self.provider = provider;
        self
    }

    /// Set the OpenSSL binary
    pub fn with_program<P: Into<PathBuf>>(mut self, program: P) -> Self {
        self.program = program.into();
        self
    }

    /// Stop accepting after `limit` connections. A connect-side identity probe
    /// uses up one of them.
    pub fn with_accept_limit(mut self, limit: Option<u32>) -> Self {
        self.accept_limit = limit;
        self
    }

    /// Arguments for the interactive session. Paths are passed through
    /// unchanged, so non-UTF-8 file names survive.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = match &self.role {
            Role::Connect { peer } => vec!["s_client".into(), "-connect".into(), peer.into()],
            Role::Accept { port } => {
                let mut args: Vec<OsString> =
                    vec!["s_server".into(), "-accept".into(), port.to_string().into()];
                if let Some(limit) = self.accept_limit {
                    args.extend([OsString::from("-naccept"), limit.to_string().into()]);
                }
                args
            }
        };

        args.extend([
            OsString::from("-cert"),
            self.paths.cert_path.clone().into_os_string(),
            "-key".into(),
            self.paths.key_path.clone().into_os_string(),
            "-CAfile".into(),
            self.paths.ca_path.clone().into_os_string(),
            "-tls1_3".into(),
            "-groups".into(),
            (&self.group).into(),
        ]);

        match self.role {
            // Require and verify a client certificate
            Role::Accept { .. } => args.extend([OsString::from("-Verify"), "1".into()]),
            Role::Connect { .. } => args.push("-verify_return_error".into()),
        }

        if let Some(provider) = &self.provider {
            args.extend([
                OsString::from("-provider"),
                provider.into(),
                "-provider".into(),
                "default".into(),
            ]);
        }

        args.push("-state".into());
        args
    }

    /// Arguments for a one-shot certificate inspection handshake.
    /// Only the connect role can probe.
    pub fn probe_args(&self) -> Option<Vec<OsString>> {
        match self.role {
            Role::Connect { .. } => {
                let mut args = self.args();
                args.extend([OsString::from("-showcerts"), "-msg".into()]);
                Some(args)
            }
            Role::Accept { .. } => None,
        }
    }
}

/// The running transport endpoint
pub struct TunnelProcess {
    pid:        Option<u32>,
    stdin:      Option<ChildStdin>,
    stdout:     Option<ChildStdout>,
    stderr:     Option<ChildStderr>,
    terminator: Terminator,
    watcher:    Option<JoinHandle<io::Result<std::process::ExitStatus>>>,
}

impl TunnelProcess {
    /// Launch the endpoint described by `spec`
    pub fn start(spec: &TunnelSpec) -> Result<Self, TunnelError> {
        info!(
            role = %spec.role,
            program = ?spec.program,
            group = %spec.group,
            "Starting transport endpoint"
        );
        Self::spawn(&spec.program, spec.args())
    }

    /// Launch `program` with piped standard streams
    pub fn spawn<I, S>(program: &Path, args: I) -> Result<Self, TunnelError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TunnelError::Launch {
                program: program.display().to_string(),
                source,
            })?;

        let pid = child.id();
        let stdin = child.stdin.take().ok_or(TunnelError::IoSetup("stdin"))?;
        let stdout = child.stdout.take().ok_or(TunnelError::IoSetup("stdout"))?;
        let stderr = child.stderr.take().ok_or(TunnelError::IoSetup("stderr"))?;

        let terminator = Terminator::new();
        let watcher = tokio::spawn(supervise(child, terminator.clone()));
        debug!(?pid, "Transport endpoint running");

        Ok(Self {
            pid,
            stdin: Some(stdin),
            stdout: Some(stdout),
            stderr: Some(stderr),
            terminator,
            watcher: Some(watcher),
        })
    }

    /// OS process id of the endpoint
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the endpoint to stop. Safe to call any number of times.
    pub fn terminate(&self, cause: TerminationCause) -> bool {
        self.terminator.terminate(cause)
    }

    /// Wait for the endpoint to exit
    pub async fn wait(mut self) -> Result<ChannelExit, TunnelError> {
        let watcher = self
            .watcher
            .take()
            .ok_or_else(|| TunnelError::Wait(io::Error::other("transport already awaited")))?;
        let status = watcher
            .await
            .map_err(|e| TunnelError::Wait(io::Error::other(e)))?
            .map_err(TunnelError::Wait)?;

        let exit = ChannelExit {
            code:  status.code(),
            cause: self.terminator.cause(),
        };
        info!(pid = ?self.pid, code = ?exit.code, cause = ?exit.cause, "Transport endpoint exited");
        Ok(exit)
    }
}

impl Drop for TunnelProcess {
    fn drop(&mut self) {
        // Dropping the watcher drops the child, which kills it.
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

impl SecureChannel for TunnelProcess {
    type Reader = ChildStdout;
    type Writer = ChildStdin;
    type Diagnostics = ChildStderr;

    fn split(&mut self) -> Result<(Self::Reader, Self::Writer), TunnelError> {
        let stdout = self.stdout.take().ok_or(TunnelError::IoSetup("stdout"))?;
        let stdin = self.stdin.take().ok_or(TunnelError::IoSetup("stdin"))?;
        Ok((stdout, stdin))
    }

    fn take_diagnostics(&mut self) -> Option<Self::Diagnostics> {
        self.stderr.take()
    }

    fn terminator(&self) -> Terminator {
        self.terminator.clone()
    }

    async fn closed(self) -> Result<ChannelExit, TunnelError> {
        self.wait().await
    }
}

async fn supervise(mut child: Child, terminator: Terminator) -> io::Result<std::process::ExitStatus> {
    tokio::select! {
        status = child.wait() => {
            let status = status?;
            debug!(%status, "Transport endpoint exited on its own");
            Ok(status)
        }
        _ = terminator.terminated() => stop(&mut child).await,
    }
}

async fn stop(child: &mut Child) -> io::Result<std::process::ExitStatus> {
    #[cfg(unix)]
    {
        use nix::{
            sys::signal::{kill, Signal},
            unistd::Pid,
        };

        // The child has not been reaped yet, so its pid cannot have been reused.
        if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
            match kill(Pid::from_raw(pid), Signal::SIGTERM) {
                Ok(()) => match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                    Ok(status) => return status,
                    Err(_) => warn!(pid, "Transport ignored SIGTERM, killing it"),
                },
                Err(e) => debug!(pid, error = %e, "SIGTERM not delivered"),
            }
        }
    }

    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Transport already gone");
    }
    child.wait().await
}

/// Run the probe handshake for `spec` and collect its output.
///
/// Standard input is closed, so `s_client` disconnects right after the
/// handshake and the certificate dump.
pub async fn run_probe(spec: &TunnelSpec) -> Result<Option<Output>, TunnelError> {
    let Some(args) = spec.probe_args() else {
        return Ok(None);
    };

    info!(role = %spec.role, "Probing peer certificate");
    let output = Command::new(&spec.program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| TunnelError::Launch {
            program: spec.program.display().to_string(),
            source,
        })?;
    Ok(Some(output))
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, BufReader};

    use super::*;
    use crate::channel::{read_line, write_line};

    fn paths() -> CredentialPaths {
        CredentialPaths::in_dir("/creds", "/ca/ca_cert.pem")
    }

    fn spec(role: Role) -> TunnelSpec {
        TunnelSpec::new(role, paths())
            .with_group("p521_kyber1024")
            .with_provider(None)
            .with_program("openssl")
    }

    fn contains_pair(args: &[OsString], flag: &str, value: &str) -> bool {
        args.windows(2)
            .any(|w| w[0].as_os_str() == OsStr::new(flag) && w[1].as_os_str() == OsStr::new(value))
    }

    fn has_flag(args: &[OsString], flag: &str) -> bool {
        args.iter().any(|arg| arg.as_os_str() == OsStr::new(flag))
    }

    #[test]
    fn test_connect_args() {
        let args = spec(Role::Connect {
            peer: "localhost:4433".into(),
        })
        .args();

        assert_eq!(args[0], OsString::from("s_client"));
        assert!(contains_pair(&args, "-connect", "localhost:4433"));
        assert!(contains_pair(&args, "-cert", "/creds/certificate.pem"));
        assert!(contains_pair(&args, "-key", "/creds/private_key.pem"));
        assert!(contains_pair(&args, "-CAfile", "/ca/ca_cert.pem"));
        assert!(contains_pair(&args, "-groups", "p521_kyber1024"));
        assert!(has_flag(&args, "-tls1_3"));
        assert!(has_flag(&args, "-verify_return_error"));
        assert!(has_flag(&args, "-state"));
        assert!(!has_flag(&args, "-provider"));
    }

    #[test]
    fn test_accept_args() {
        let args = spec(Role::Accept { port: 4433 }).args();

        assert_eq!(args[0], OsString::from("s_server"));
        assert!(contains_pair(&args, "-accept", "4433"));
        assert!(!has_flag(&args, "-naccept"));
        assert!(contains_pair(&args, "-Verify", "1"));
        assert!(has_flag(&args, "-tls1_3"));
    }

    #[test]
    fn test_accept_limit() {
        let args = spec(Role::Accept { port: 4433 })
            .with_accept_limit(Some(1))
            .args();
        assert!(contains_pair(&args, "-naccept", "1"));
    }

    #[test]
    fn test_provider_args() {
        let args = spec(Role::Accept { port: 1 })
            .with_provider(Some("oqsprovider".into()))
            .args();

        assert!(contains_pair(&args, "-provider", "oqsprovider"));
        assert!(contains_pair(&args, "-provider", "default"));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_paths_are_kept() {
        use std::os::unix::ffi::OsStrExt;

        let dir = PathBuf::from(OsStr::from_bytes(b"/creds/\xff"));
        let args = TunnelSpec::new(
            Role::Connect {
                peer: "h:1".into(),
            },
            CredentialPaths::in_dir(dir.clone(), "/ca.pem"),
        )
        .args();

        let cert = dir.join("certificate.pem").into_os_string();
        assert!(args
            .windows(2)
            .any(|w| w[0] == OsString::from("-cert") && w[1] == cert));
    }

    #[test]
    fn test_probe_args_only_for_connect() {
        let connect = spec(Role::Connect {
            peer: "h:1".into(),
        });
        let probe = connect.probe_args().unwrap();
        assert!(has_flag(&probe, "-showcerts"));
        assert!(has_flag(&probe, "-msg"));

        assert!(spec(Role::Accept { port: 1 }).probe_args().is_none());
    }

    #[tokio::test]
    async fn test_launch_missing_binary() {
        let result = TunnelProcess::spawn(Path::new("/nonexistent/openssl-12345"), ["s_client"]);
        assert!(matches!(result, Err(TunnelError::Launch { .. })));
    }

    #[tokio::test]
    async fn test_probe_missing_binary() {
        let spec = spec(Role::Connect {
            peer: "h:1".into(),
        })
        .with_program("/nonexistent/openssl-12345");
        assert!(matches!(run_probe(&spec).await, Err(TunnelError::Launch { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_relays_through_child_and_terminates_once() {
        let mut tunnel = TunnelProcess::spawn(Path::new("cat"), Vec::<String>::new()).unwrap();
        assert!(tunnel.pid().is_some());

        let (stdout, mut stdin) = tunnel.split().unwrap();
        assert!(matches!(tunnel.split(), Err(TunnelError::IoSetup(_))));

        write_line(&mut stdin, "ping").await.unwrap();
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        read_line(&mut reader, &mut line).await.unwrap();
        assert_eq!(line, "ping\n");

        assert!(tunnel.terminate(TerminationCause::LocalExit));
        assert!(!tunnel.terminate(TerminationCause::LocalExit));

        let exit = tunnel.closed().await.unwrap();
        assert_eq!(exit.cause, Some(TerminationCause::LocalExit));
        assert!(!exit.is_unrequested_failure());

        // The pipe closes with the process.
        assert_eq!(read_line(&mut reader, &mut line).await.unwrap(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let tunnel = TunnelProcess::spawn(Path::new("sh"), ["-c", "exit 3"]).unwrap();
        let exit = tunnel.wait().await.unwrap();

        assert_eq!(exit.code, Some(3));
        assert_eq!(exit.cause, None);
        assert!(exit.is_unrequested_failure());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_diagnostics_are_separate() {
        let mut tunnel = TunnelProcess::spawn(
            Path::new("sh"),
            ["-c", "echo 'subject=CN = srv' >&2; echo data"],
        )
        .unwrap();
        let mut stderr = tunnel.take_diagnostics().unwrap();
        assert!(tunnel.take_diagnostics().is_none());
        let (mut stdout, _stdin) = tunnel.split().unwrap();

        let mut diagnostics = String::new();
        stderr.read_to_string(&mut diagnostics).await.unwrap();
        let mut data = String::new();
        stdout.read_to_string(&mut data).await.unwrap();

        assert_eq!(diagnostics, "subject=CN = srv\n");
        assert_eq!(data, "data\n");
        assert_eq!(tunnel.wait().await.unwrap().code, Some(0));
    }
}
