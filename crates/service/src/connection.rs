use std::fmt;

use bytes::Bytes;

/// Error produced when constructing a [`PubKey`] from input of the wrong
/// length.
#[derive(Debug, PartialEq, Eq)]
pub struct PubKeyError(pub usize);

impl std::error::Error for PubKeyError {}

impl fmt::Display for PubKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid pubkey: expected {} bytes, got {}", PubKey::LEN, self.0)
    }
}

/// A service node's 32-byte public key, as verified by the transport's
/// authentication layer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PubKey([u8; 32]);

impl PubKey {
    pub const LEN: usize = 32;

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for PubKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for PubKey {
    type Error = PubKeyError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self(
            <[u8; 32]>::try_from(bytes).map_err(|_| PubKeyError(bytes.len()))?,
        ))
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", self)
    }
}

/// Identity of a peer connection.
///
/// A service node is globally identified by its public key: commands
/// addressed to it route to whichever live link currently terminates that
/// peer, regardless of the transport path. An ephemeral remote has no
/// identity beyond the current socket, so it is keyed by the locally assigned
/// handle plus the router's return path; the two variants never compare
/// equal to each other.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionId {
    /// Peer recognised as a service node, identified by its verified pubkey.
    ServiceNode(PubKey),
    /// Ephemeral remote peer.
    Remote {
        /// Locally assigned handle; 0 never matches a live connection.
        id: u64,
        /// Opaque return path on the router socket; empty on outgoing links.
        route: Bytes,
    },
}

impl ConnectionId {
    pub fn sn(pubkey: PubKey) -> Self {
        Self::ServiceNode(pubkey)
    }

    pub fn remote(id: u64, route: Bytes) -> Self {
        Self::Remote { id, route }
    }

    pub fn is_sn(&self) -> bool {
        matches!(self, Self::ServiceNode(_))
    }

    /// False only for the default-constructed identity, which matches no
    /// live connection.
    pub fn is_valid(&self) -> bool {
        match self {
            Self::ServiceNode(_) => true,
            Self::Remote { id, .. } => *id != 0,
        }
    }

    pub fn pubkey(&self) -> Option<&PubKey> {
        match self {
            Self::ServiceNode(pubkey) => Some(pubkey),
            Self::Remote { .. } => None,
        }
    }

    /// Returns a copy with the routing prefix discarded, so identities can be
    /// compared regardless of the specific connection path. Service node
    /// identities carry no route and are returned unchanged.
    pub fn unrouted(&self) -> Self {
        match self {
            Self::ServiceNode(pubkey) => Self::ServiceNode(*pubkey),
            Self::Remote { id, .. } => Self::Remote {
                id: *id,
                route: Bytes::new(),
            },
        }
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::Remote {
            id: 0,
            route: Bytes::new(),
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServiceNode(pubkey) => write!(f, "sn:{}", pubkey),
            Self::Remote { id, .. } => write!(f, "conn:{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    use super::*;

    fn hash(id: &ConnectionId) -> u64 {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn pubkey_length_is_checked() {
        assert!(PubKey::try_from([1u8; 32].as_slice()).is_ok());
        assert_eq!(PubKey::try_from([1u8; 31].as_slice()), Err(PubKeyError(31)));
        assert_eq!(PubKey::try_from([1u8; 33].as_slice()), Err(PubKeyError(33)));
    }

    #[test]
    fn default_identity_is_invalid() {
        assert!(!ConnectionId::default().is_valid());
        assert!(ConnectionId::remote(1, Bytes::new()).is_valid());
    }

    #[test]
    fn equality_is_variant_disjoint() {
        let sn = ConnectionId::sn(PubKey::from([7u8; 32]));
        let remote = ConnectionId::remote(3, Bytes::from_static(b"\x00abcd"));

        assert_ne!(sn, remote);
        assert_eq!(sn, ConnectionId::sn(PubKey::from([7u8; 32])));
        assert_ne!(sn, ConnectionId::sn(PubKey::from([8u8; 32])));

        // Remote identity requires both the handle and the route to match.
        assert_ne!(remote, ConnectionId::remote(3, Bytes::new()));
        assert_ne!(remote, ConnectionId::remote(4, Bytes::from_static(b"\x00abcd")));
        assert_eq!(remote, ConnectionId::remote(3, Bytes::from_static(b"\x00abcd")));
    }

    #[test]
    fn equal_ids_hash_alike() {
        let a = ConnectionId::remote(9, Bytes::from_static(b"\x00\x00\x00\x00\x09"));
        let b = ConnectionId::remote(9, Bytes::from_static(b"\x00\x00\x00\x00\x09"));
        assert_eq!(a, b);
        assert_eq!(hash(&a), hash(&b));
    }

    #[test]
    fn unrouted_discards_only_the_route() {
        let routed = ConnectionId::remote(5, Bytes::from_static(b"\x00wxyz"));
        assert_eq!(routed.unrouted(), ConnectionId::remote(5, Bytes::new()));

        let sn = ConnectionId::sn(PubKey::from([2u8; 32]));
        assert_eq!(sn.unrouted(), sn);
    }
}
