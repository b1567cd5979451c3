//! Peer identity extraction.
//!
//! The OpenSSL endpoint does not hand out the verified peer certificate, so
//! the peer's Common Name is scraped from the `subject=` lines it prints. This
//! is a fallback for backends without a certificate API; the result is for
//! display only and never used for authorization.

use std::sync::{Arc, LazyLock};

use futures_util::{stream, Stream, StreamExt};
use regex::Regex;
use tokio::{
    io::{AsyncRead, BufReader},
    sync::watch,
};
use tracing::{debug, info, trace, warn};

use crate::{
    channel::read_line,
    config::{UpdatePolicy, UNKNOWN_IDENTITY},
    error::SessionError,
    tunnel::{run_probe, TunnelSpec},
};

/// `subject=` followed by a `CN` attribute; the value stops at a comma,
/// whitespace or the end of the line.
static SUBJECT_CN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)subject=.*?\bCN\s*=\s*([^,\s]+)").expect("subject regex is valid")
});

/// Common Name from a certificate subject line, if the line has one
pub fn extract_common_name(line: &str) -> Option<String> {
    let captures = SUBJECT_CN.captures(line)?;
    let value = captures.get(1)?.as_str().trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// The peer identity shared between the extractor and the relay.
///
/// Single-slot `watch` channel: writers replace the value, readers see the
/// latest one or wait for the first.
#[derive(Debug, Clone)]
pub struct IdentitySlot {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for IdentitySlot {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentitySlot {
    /// An empty slot
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Extracted identity, if any
    pub fn get(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Extracted identity or the `unknown` placeholder
    pub fn current(&self) -> String {
        self.get().unwrap_or_else(|| UNKNOWN_IDENTITY.to_string())
    }

    /// Store `cn` if `policy` allows it. Returns whether the slot changed.
    pub fn update(&self, cn: &str, policy: UpdatePolicy) -> bool {
        self.tx.send_if_modified(|slot| match (policy, slot.as_deref()) {
            (UpdatePolicy::FirstMatch, Some(_)) => false,
            (UpdatePolicy::EveryMatch, Some(existing)) if existing == cn => false,
            _ => {
                *slot = Some(cn.to_string());
                true
            }
        })
    }

    /// Wait until an identity has been extracted
    pub async fn identified(&self) -> Option<String> {
        let mut rx = self.tx.subscribe();
        let value = rx.wait_for(Option::is_some).await.ok()?;
        (*value).clone()
    }
}

/// Lazily yields every Common Name found in `reader`, line by line.
///
/// The sequence ends with the stream; a read error ends it early.
pub fn identity_updates<R>(reader: R) -> impl Stream<Item = String>
where
    R: AsyncRead + Unpin,
{
    stream::unfold(BufReader::new(reader), |mut reader| async move {
        let mut line = String::new();
        loop {
            match read_line(&mut reader, &mut line).await {
                Ok(0) => return None,
                Ok(_) => match extract_common_name(&line) {
                    Some(cn) => {
                        debug!(target: "pqchat::diagnostics", line = %line.trim_end(), "Subject line");
                        return Some((cn, reader));
                    }
                    None => trace!(target: "pqchat::diagnostics", line = %line.trim_end()),
                },
                Err(e) => {
                    debug!(error = %e, "Diagnostic stream failed");
                    return None;
                }
            }
        }
    })
}

/// Feeds extracted identities into an [`IdentitySlot`]
#[derive(Debug, Clone)]
pub struct IdentityExtractor {
    slot:   IdentitySlot,
    policy: UpdatePolicy,
}

impl IdentityExtractor {
    /// Extractor writing into `slot` under `policy`
    pub fn new(slot: IdentitySlot, policy: UpdatePolicy) -> Self {
        Self { slot, policy }
    }

    /// The slot this extractor writes to
    pub fn slot(&self) -> &IdentitySlot {
        &self.slot
    }

    /// Check one line; returns whether the identity changed
    pub fn observe(&self, line: &str) -> bool {
        match extract_common_name(line) {
            Some(cn) => self.apply(&cn),
            None => false,
        }
    }

    fn apply(&self, cn: &str) -> bool {
        let changed = self.slot.update(cn, self.policy);
        if changed {
            info!(cn, "Peer identity extracted");
        }
        changed
    }

    /// Drain `reader`, applying every match. Returns how many updates changed
    /// the slot.
    pub async fn run<R>(self, reader: R) -> usize
    where
        R: AsyncRead + Unpin,
    {
        let mut updates = std::pin::pin!(identity_updates(reader));
        let mut applied = 0;
        while let Some(cn) = updates.next().await {
            if self.apply(&cn) {
                applied += 1;
            }
        }
        debug!(applied, "Diagnostic stream closed");
        applied
    }

    /// Run a one-shot inspection handshake before the session and scan its
    /// output. Returns the identity in the slot afterwards.
    ///
    /// Only the connect role can probe; for the accept role this is a no-op
    /// and live extraction has to cover it.
    pub async fn probe(&self, spec: &TunnelSpec) -> Result<Option<String>, SessionError> {
        let Some(output) = run_probe(spec).await? else {
            warn!(role = %spec.role, "Identity probe needs the connect role, using live extraction");
            return Ok(None);
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(SessionError::Probe(format!(
                "{}: {}",
                output.status,
                stderr.trim()
            )));
        }

        for line in stdout.lines().chain(stderr.lines()) {
            self.observe(line);
        }
        let identity = self.slot.get();
        if identity.is_none() {
            warn!("Probe finished without a certificate subject");
        }
        Ok(identity)
    }
}
