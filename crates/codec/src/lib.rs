//! Wire vocabulary and multipart framing for the curvemq protocol.
//!
//! Peers exchange multipart messages over a dealer/router style link. Each
//! message is a run of frames where every frame but the last carries a `more`
//! flag; the framing itself lives in [`frame`]. On top of that, this crate
//! fixes the protocol's bit-exact vocabulary: the `HI`/`HELLO` handshake, the
//! `REPLY` marker introducing request responses, the failure reason strings,
//! and the `category.command` addressing scheme.

pub mod frame;

/// Handshake request, sent by a connecting peer as its first frame.
pub const HI: &[u8] = b"HI";

/// Handshake acknowledgement, sent as a single frame in response to [`HI`].
pub const HELLO: &[u8] = b"HELLO";

/// Marker frame introducing the reply to a request command.
pub const REPLY: &[u8] = b"REPLY";

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    FrameOversize,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FrameOversize => write!(f, "frame exceeds the maximum allowed size"),
        }
    }
}

/// Wire-visible rejection reasons.
///
/// A rejected dispatch is reported back to the peer out-of-band as a failure
/// message carrying one of these strings; the connection itself stays up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    /// Command not present in the registry.
    UnknownCommand,
    /// Request command invoked without a reply tag frame.
    NoReplyTag,
    /// The peer's authorization tier is below the command's requirement.
    Forbidden,
    /// The command may only be invoked by a recognised service node.
    ForbiddenSn,
    /// The command is only served by a process configured as a service node.
    NotAServiceNode,
    /// The handler faulted while executing; synthesised so a requesting peer
    /// is not left waiting for a reply that will never come.
    HandlerFailure,
}

impl Reason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownCommand => "UNKNOWNCOMMAND",
            Self::NoReplyTag => "NO_REPLY_TAG",
            Self::Forbidden => "FORBIDDEN",
            Self::ForbiddenSn => "FORBIDDEN_SN",
            Self::NotAServiceNode => "NOT_A_SERVICE_NODE",
            Self::HandlerFailure => "HANDLER_FAILURE",
        }
    }

    pub const fn as_bytes(&self) -> &'static [u8] {
        self.as_str().as_bytes()
    }

    /// Parses a received frame as a failure reason.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Some(match bytes {
            b"UNKNOWNCOMMAND" => Self::UnknownCommand,
            b"NO_REPLY_TAG" => Self::NoReplyTag,
            b"FORBIDDEN" => Self::Forbidden,
            b"FORBIDDEN_SN" => Self::ForbiddenSn,
            b"NOT_A_SERVICE_NODE" => Self::NotAServiceNode,
            b"HANDLER_FAILURE" => Self::HandlerFailure,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Splits a dispatchable command name into its category and command parts.
///
/// The separator is the first `'.'`, and it must appear exactly once; anything
/// else does not address a registered command.
///
/// ```
/// assert_eq!(curvemq_codec::split_command("sys.ping"), Some(("sys", "ping")));
/// assert_eq!(curvemq_codec::split_command("ping"), None);
/// assert_eq!(curvemq_codec::split_command("a.b.c"), None);
/// ```
pub fn split_command(name: &str) -> Option<(&str, &str)> {
    let (category, command) = name.split_once('.')?;
    if category.is_empty() || command.is_empty() || command.contains('.') {
        return None;
    }

    Some((category, command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_round_trip() {
        for reason in [
            Reason::UnknownCommand,
            Reason::NoReplyTag,
            Reason::Forbidden,
            Reason::ForbiddenSn,
            Reason::NotAServiceNode,
            Reason::HandlerFailure,
        ] {
            assert_eq!(Reason::from_bytes(reason.as_bytes()), Some(reason));
        }

        assert_eq!(Reason::from_bytes(b"REPLY"), None);
        assert_eq!(Reason::from_bytes(b""), None);
    }

    #[test]
    fn command_addressing() {
        assert_eq!(split_command("x.r"), Some(("x", "r")));
        assert_eq!(split_command("x."), None);
        assert_eq!(split_command(".r"), None);
        assert_eq!(split_command("x..r"), None);
        assert_eq!(split_command(""), None);
    }
}
