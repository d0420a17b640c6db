//! Peer identity and connection metadata.

use std::fmt;

/// Suffix of peer hostnames on the anonymizing network.
pub const HOSTNAME_SUFFIX: &str = ".onion";

/// Opaque identity of a remote peer, as vouched for by the transport.
///
/// The value is the peer's hostname on the anonymizing network. Nothing in
/// this crate interprets it beyond stripping [`HOSTNAME_SUFFIX`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self(hostname.into())
    }

    pub fn hostname(&self) -> &str {
        &self.0
    }

    /// Hostname without the network suffix. Used to name staging directories.
    pub fn service_id(&self) -> &str {
        self.0.strip_suffix(HOSTNAME_SUFFIX).unwrap_or(&self.0)
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        let id = self.service_id();
        let end = id
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(id.len());
        &id[..end]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a connection exists. Only known contacts may open chat/file channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPurpose {
    /// Authenticated peer that is a previously authorized contact.
    KnownContact,
    /// Authenticated peer we have no contact relationship with.
    Unauthenticated,
}

/// Which side dialed the connection. Decides channel id parity so both
/// sides can open channels without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens odd channel ids.
    Initiator,
    /// Opens even channel ids.
    Responder,
}
