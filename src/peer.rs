//! Peer-connection state surface.
//!
//! The actual signalling and ICE machinery live outside this crate; the loops
//! only care about state transitions, and specifically about the terminal
//! ones that must stop streaming.

use std::fmt;

use crate::cancel::CancelToken;

/// High-level peer connection state, as reported by the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// Whether this state ends the session. Failed, Closed and Disconnected
    /// all stop the loops; none of them is treated as an error.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PeerState::Failed | PeerState::Closed | PeerState::Disconnected
        )
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::New => "new",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
            PeerState::Failed => "failed",
            PeerState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Bridges peer-state callbacks to the cancellation token.
///
/// Registered as the state-change handler on the peer connection; the
/// embedder calls [`PeerWatch::on_state_change`] from its event surface.
#[derive(Clone)]
pub struct PeerWatch {
    token: CancelToken,
}

impl PeerWatch {
    pub fn new(token: CancelToken) -> Self {
        PeerWatch { token }
    }

    pub fn on_state_change(&self, state: PeerState) {
        debug!("Peer connection state: {}", state);
        if state.is_terminal() {
            info!("Peer connection {}, stopping streaming", state);
            self.token.fire();
        }
    }
}
