//! Protocol version negotiation.
//!
//! The first packets exchanged on a new link establish which protocol
//! version both sides will speak. No Noise traffic is sent until a version
//! is agreed; a peer that never sends a `VersionHello` within the initial
//! link window is assumed to speak the legacy v1 wire format.

use std::time::{Duration, Instant};

/// How long to wait for a `VersionHello` before assuming legacy v1.
pub const INITIAL_LINK_WINDOW: Duration = Duration::from_secs(10);

/// Grace period before disconnecting a peer whose version we reject.
pub const REJECT_DISCONNECT_DELAY: Duration = Duration::from_secs(1);

/// Versions this build understands, highest first.
pub const SUPPORTED_VERSIONS: &[u8] = &[1];

/// Sent by each side on link establishment to advertise supported versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionHello {
    /// All versions this node is willing to speak, in any order.
    pub supported: Vec<u8>,
    /// This node's preferred version among those it supports.
    pub preferred: u8,
}

impl VersionHello {
    /// Build a hello advertising this build's supported versions.
    #[must_use]
    pub fn ours() -> Self {
        Self {
            supported: SUPPORTED_VERSIONS.to_vec(),
            preferred: SUPPORTED_VERSIONS[0],
        }
    }
}

/// Sent in reply to a `VersionHello`, settling on a version or rejecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionAck {
    /// The version both sides will use, if negotiation succeeded.
    pub agreed: Option<u8>,
    /// The peer's preferred version, for diagnostics, when rejecting.
    pub rejected: Option<u8>,
    /// Human-readable reason for rejection.
    pub reason: Option<String>,
}

impl VersionAck {
    /// Negotiation succeeded on `version`.
    #[must_use]
    pub fn agree(version: u8) -> Self {
        Self {
            agreed: Some(version),
            rejected: None,
            reason: None,
        }
    }

    /// No shared version exists; the peer's preference is recorded for logging.
    #[must_use]
    pub fn reject(their_preferred: u8, reason: impl Into<String>) -> Self {
        Self {
            agreed: None,
            rejected: Some(their_preferred),
            reason: Some(reason.into()),
        }
    }

    /// Whether negotiation settled on a version.
    #[must_use]
    pub fn is_agreed(&self) -> bool {
        self.agreed.is_some()
    }
}

/// Picks the highest mutually supported version and tracks whether the
/// initial link window for a `VersionHello` has elapsed.
pub struct VersionNegotiator {
    link_established_at: Instant,
    negotiated: Option<u8>,
}

impl Default for VersionNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionNegotiator {
    /// Start tracking a newly established link.
    #[must_use]
    pub fn new() -> Self {
        Self {
            link_established_at: Instant::now(),
            negotiated: None,
        }
    }

    /// Whether a version has already been settled, either by explicit
    /// negotiation or by the legacy-v1 assumption.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.negotiated.is_some()
    }

    /// The negotiated version, once settled.
    #[must_use]
    pub fn version(&self) -> Option<u8> {
        self.negotiated
    }

    /// Receive a peer's `VersionHello` and compute our reply.
    ///
    /// Picks the highest version present in both `SUPPORTED_VERSIONS` and
    /// `hello.supported`. Settles `self` on success.
    pub fn receive_hello(&mut self, hello: &VersionHello) -> VersionAck {
        let agreed = SUPPORTED_VERSIONS
            .iter()
            .copied()
            .filter(|v| hello.supported.contains(v))
            .max();

        match agreed {
            Some(version) => {
                self.negotiated = Some(version);
                VersionAck::agree(version)
            }
            None => VersionAck::reject(hello.preferred, "no overlapping protocol version"),
        }
    }

    /// Receive the peer's reply to our own `VersionHello`.
    pub fn receive_ack(&mut self, ack: &VersionAck) {
        if let Some(version) = ack.agreed {
            self.negotiated = Some(version);
        }
    }

    /// If the initial link window has elapsed with no hello received,
    /// assume the peer speaks legacy v1.
    pub fn assume_legacy_if_window_elapsed(&mut self) {
        if self.negotiated.is_none() && self.link_established_at.elapsed() >= INITIAL_LINK_WINDOW {
            self.negotiated = Some(1);
        }
    }
}
