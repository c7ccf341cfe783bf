//! Client state machine
//!
//! Created → Validated → Subscribed → Uploaded → Published → Connected →
//! Waited → Recorded → Disconnected

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientState {
    Created,
    Validated,
    Subscribed,
    Uploaded,
    Published,
    Connected,
    Waited,
    Recorded,
    Disconnected,
}

impl ClientState {
    /// The single forward successor, if any
    pub fn next(&self) -> Option<ClientState> {
        match self {
            ClientState::Created => Some(ClientState::Validated),
            ClientState::Validated => Some(ClientState::Subscribed),
            ClientState::Subscribed => Some(ClientState::Uploaded),
            ClientState::Uploaded => Some(ClientState::Published),
            ClientState::Published => Some(ClientState::Connected),
            ClientState::Connected => Some(ClientState::Waited),
            ClientState::Waited => Some(ClientState::Recorded),
            ClientState::Recorded => Some(ClientState::Disconnected),
            ClientState::Disconnected => None,
        }
    }

    /// Check if transition from this state to target is valid
    pub fn can_transition_to(&self, target: ClientState) -> bool {
        match (self, target) {
            // Disconnect is allowed from any state holding a live channel
            (ClientState::Connected, ClientState::Disconnected) => true,
            (ClientState::Waited, ClientState::Disconnected) => true,
            _ => self.next() == Some(target),
        }
    }

    /// A live event channel may be open
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ClientState::Connected | ClientState::Waited | ClientState::Recorded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Created => "CREATED",
            ClientState::Validated => "VALIDATED",
            ClientState::Subscribed => "SUBSCRIBED",
            ClientState::Uploaded => "UPLOADED",
            ClientState::Published => "PUBLISHED",
            ClientState::Connected => "CONNECTED",
            ClientState::Waited => "WAITED",
            ClientState::Recorded => "RECORDED",
            ClientState::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
