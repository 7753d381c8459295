//! Connection lifecycle: states and close codes.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Standard WebSocket close codes used by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    Normal,
    GoingAway,
    PolicyViolation,
    MessageTooBig,
    InternalError,
    TryAgainLater,
}

impl CloseCode {
    pub fn code(&self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::InternalError => 1011,
            CloseCode::TryAgainLater => 1013,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            CloseCode::Normal => "closed",
            CloseCode::GoingAway => "server shutting down",
            CloseCode::PolicyViolation => "unauthorized",
            CloseCode::MessageTooBig => "message too big",
            CloseCode::InternalError => "internal error",
            CloseCode::TryAgainLater => "client too slow",
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.reason())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// Legal forward moves. Nothing leaves `Closed`.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Open)
                | (Connecting, Closing)
                | (Connecting, Closed)
                | (Open, Closing)
                | (Open, Closed)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Lock-free state cell shared between a connection's pumps and the hub.
#[derive(Debug)]
pub struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    pub fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Connecting as u8))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves to `next` if legal from the current state.
    ///
    /// Returns true only for the caller that performed the move.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if !ConnectionState::from_u8(current).can_transition_to(next) {
                return false;
            }
            match self.0.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for AtomicConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_codes_match_rfc6455() {
        assert_eq!(CloseCode::Normal.code(), 1000);
        assert_eq!(CloseCode::GoingAway.code(), 1001);
        assert_eq!(CloseCode::PolicyViolation.code(), 1008);
        assert_eq!(CloseCode::MessageTooBig.code(), 1009);
        assert_eq!(CloseCode::InternalError.code(), 1011);
    }

    #[test]
    fn happy_path_walks_every_state() {
        let state = AtomicConnectionState::new();
        assert_eq!(state.get(), ConnectionState::Connecting);
        assert!(state.transition(ConnectionState::Open));
        assert!(state.transition(ConnectionState::Closing));
        assert!(state.transition(ConnectionState::Closed));
        assert_eq!(state.get(), ConnectionState::Closed);
    }

    #[test]
    fn closed_is_terminal() {
        let state = AtomicConnectionState::new();
        assert!(state.transition(ConnectionState::Closed));
        for next in [
            ConnectionState::Connecting,
            ConnectionState::Open,
            ConnectionState::Closing,
            ConnectionState::Closed,
        ] {
            assert!(!state.transition(next));
        }
    }

    #[test]
    fn only_one_caller_wins_closing() {
        let state = AtomicConnectionState::new();
        state.transition(ConnectionState::Open);
        assert!(state.transition(ConnectionState::Closing));
        assert!(!state.transition(ConnectionState::Closing));
    }

    #[test]
    fn cannot_reopen() {
        let state = AtomicConnectionState::new();
        state.transition(ConnectionState::Open);
        state.transition(ConnectionState::Closing);
        assert!(!state.transition(ConnectionState::Open));
    }
}
