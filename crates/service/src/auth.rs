use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use codec::Reason;

use crate::connection::PubKey;

/// Ordered authorization tier granted to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum AuthLevel {
    #[default]
    None,
    Basic,
    Admin,
}

impl std::fmt::Display for AuthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Basic => "basic",
            Self::Admin => "admin",
        })
    }
}

impl FromStr for AuthLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "none" => Self::None,
            "basic" => Self::Basic,
            "admin" => Self::Admin,
            _ => return Err(format!("unknown auth level: {value}")),
        })
    }
}

/// Access policy governing who may invoke a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Access {
    /// Minimum tier the calling peer must hold.
    pub level: AuthLevel,
    /// The command is only callable by a peer recognised as a service node.
    pub remote_sn_only: bool,
    /// The command is only served when the local process is itself configured
    /// as a service node.
    pub local_sn_only: bool,
}

impl Access {
    pub const fn new(level: AuthLevel) -> Self {
        Self {
            level,
            remote_sn_only: false,
            local_sn_only: false,
        }
    }

    /// Applies the policy ladder for a dispatch attempt.
    ///
    /// Local service node violations take precedence over remote ones, which
    /// take precedence over an insufficient tier.
    pub fn check(&self, level: AuthLevel, local_sn: bool, peer_sn: bool) -> Result<(), Reason> {
        if self.local_sn_only && !local_sn {
            return Err(Reason::NotAServiceNode);
        }

        if self.remote_sn_only && !peer_sn {
            return Err(Reason::ForbiddenSn);
        }

        if level < self.level {
            return Err(Reason::Forbidden);
        }

        Ok(())
    }
}

impl From<AuthLevel> for Access {
    fn from(level: AuthLevel) -> Self {
        Self::new(level)
    }
}

/// Grant attached to a connection when it is admitted.
#[derive(Debug, Clone, Copy, Default)]
pub struct Allow {
    pub level: AuthLevel,
    /// Whether the peer is recognised as a service node.
    pub service_node: bool,
}

/// Per-listener authentication callback.
///
/// Invoked once when a connection is admitted, with the remote address and
/// the transport-verified pubkey (absent on plaintext listeners). The core
/// treats it as a pure function of its arguments; a listener without a
/// callback grants [`AuthLevel::None`] and no service node status.
pub type AllowFn = Arc<dyn Fn(&SocketAddr, Option<&PubKey>) -> Allow + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered() {
        assert!(AuthLevel::None < AuthLevel::Basic);
        assert!(AuthLevel::Basic < AuthLevel::Admin);
        assert_eq!("basic".parse::<AuthLevel>(), Ok(AuthLevel::Basic));
        assert!("root".parse::<AuthLevel>().is_err());
    }

    #[test]
    fn ladder_precedence() {
        let access = Access {
            level: AuthLevel::Admin,
            remote_sn_only: true,
            local_sn_only: true,
        };

        // All three conditions violated: the local service node check wins.
        assert_eq!(
            access.check(AuthLevel::None, false, false),
            Err(Reason::NotAServiceNode)
        );
        // Local satisfied: the remote check is next.
        assert_eq!(
            access.check(AuthLevel::None, true, false),
            Err(Reason::ForbiddenSn)
        );
        // Both node checks satisfied: the tier is compared last.
        assert_eq!(
            access.check(AuthLevel::Basic, true, true),
            Err(Reason::Forbidden)
        );
        assert_eq!(access.check(AuthLevel::Admin, true, true), Ok(()));
    }

    #[test]
    fn plain_level_check() {
        let access = Access::new(AuthLevel::Basic);
        assert_eq!(
            access.check(AuthLevel::None, false, false),
            Err(Reason::Forbidden)
        );
        assert_eq!(access.check(AuthLevel::Basic, false, false), Ok(()));
        assert_eq!(access.check(AuthLevel::Admin, false, false), Ok(()));
    }
}
