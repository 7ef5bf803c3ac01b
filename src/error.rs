//! Closed error kinds for the connection stack.
//!
//! Collaborators return `anyhow::Error`; the link and session layers downcast
//! to these kinds to decide between local recovery and propagation.

use core::fmt;

/// Transient failures of the radio or the socket beneath the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    Timeout,
    AssociationFailed(String),
    SendFailed(String),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Timeout => write!(f, "timed out"),
            NetworkError::AssociationFailed(why) => write!(f, "association failed: {}", why),
            NetworkError::SendFailed(why) => write!(f, "send failed: {}", why),
        }
    }
}

impl std::error::Error for NetworkError {}

impl NetworkError {
    /// Recover a `NetworkError` from a collaborator error, handing back
    /// anything else untouched.
    pub fn classify(err: anyhow::Error) -> anyhow::Result<Self> {
        err.downcast::<NetworkError>()
    }
}

/// Failures of the publish/subscribe session itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    NotConnected,
    PingTimeout,
    Refused(String),
    Malformed(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::NotConnected => write!(f, "not connected"),
            ProtocolError::PingTimeout => write!(f, "PINGRESP not returned from broker"),
            ProtocolError::Refused(why) => write!(f, "connection refused: {}", why),
            ProtocolError::Malformed(why) => write!(f, "malformed broker response: {}", why),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    Network(NetworkError),
    Protocol(ProtocolError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Network(e) => write!(f, "{}", e),
            SessionError::Protocol(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<NetworkError> for SessionError {
    fn from(e: NetworkError) -> Self {
        SessionError::Network(e)
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::Protocol(e)
    }
}

impl SessionError {
    /// Like [`NetworkError::classify`], accepting any of the session kinds.
    pub fn classify(err: anyhow::Error) -> anyhow::Result<Self> {
        let err = match err.downcast::<SessionError>() {
            Ok(e) => return Ok(e),
            Err(err) => err,
        };
        let err = match err.downcast::<NetworkError>() {
            Ok(e) => return Ok(e.into()),
            Err(err) => err,
        };
        err.downcast::<ProtocolError>().map(SessionError::from)
    }
}

/// Bad message content. Logged and ignored, never escalated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    InvalidTimestamp(String),
    OutOfRange(i64),
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadError::InvalidTimestamp(raw) => write!(f, "timestamp was invalid ({})", raw),
            PayloadError::OutOfRange(ms) => write!(f, "time out of range ({})", ms),
        }
    }
}

impl std::error::Error for PayloadError {}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn classify_finds_session_kinds() {
        let e = SessionError::classify(anyhow::Error::new(NetworkError::Timeout)).unwrap();
        assert_eq!(e, SessionError::Network(NetworkError::Timeout));

        let e = SessionError::classify(anyhow::Error::new(ProtocolError::PingTimeout)).unwrap();
        assert_eq!(e, SessionError::Protocol(ProtocolError::PingTimeout));

        let wrapped = anyhow::Error::new(ProtocolError::NotConnected).context("polling");
        let e = SessionError::classify(wrapped).unwrap();
        assert_eq!(e, SessionError::Protocol(ProtocolError::NotConnected));
    }

    #[test]
    fn classify_passes_other_errors_through() {
        let err = SessionError::classify(anyhow!("bus fault")).unwrap_err();
        assert_eq!(err.to_string(), "bus fault");

        let err = NetworkError::classify(anyhow::Error::new(ProtocolError::PingTimeout));
        assert!(err.is_err());
    }

    #[test]
    fn messages_read_like_status_text() {
        let e = SessionError::from(NetworkError::SendFailed("ECONNRESET".into()));
        assert_eq!(e.to_string(), "send failed: ECONNRESET");
        assert_eq!(
            PayloadError::InvalidTimestamp("abc".into()).to_string(),
            "timestamp was invalid (abc)"
        );
    }
}
