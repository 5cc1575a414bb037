//! Wire contract between patchworld servers and clients: request/response
//! message types, the closed status enum, and per-client permissions.
//!
//! Transport framing (length prefixes, sockets) lives in `patchworld-net`;
//! this crate only defines what travels inside a frame.

use patchworld_core::{AgentState, Direction, ItemInstance, Position, SimulatorError};
use serde::{Deserialize, Serialize};

/// Closed result enum carried by every response.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Status {
    Ok,
    InvalidAgentId,
    OutOfRange,
    ServerParseMessageError,
    ClientParseMessageError,
    ServerOutOfMemory,
    ClientOutOfMemory,
    PermissionDenied,
}

impl From<&SimulatorError> for Status {
    fn from(error: &SimulatorError) -> Self {
        match error {
            SimulatorError::InvalidAgentId(_) | SimulatorError::InvalidSemaphoreId(_) => {
                Status::InvalidAgentId
            }
            SimulatorError::ActionAlreadyQueued(_) | SimulatorError::OutOfRange(_) => {
                Status::OutOfRange
            }
            SimulatorError::InvalidConfig(_) | SimulatorError::Energy(_) => {
                Status::ServerParseMessageError
            }
        }
    }
}

/// What a connected client is allowed to call. Denied calls return
/// [`Status::PermissionDenied`] without mutating state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Permissions {
    pub add_agent: bool,
    pub remove_agent: bool,
    pub remove_client: bool,
    pub set_active: bool,
    pub get_map: bool,
    pub get_agent_ids: bool,
    pub get_agent_states: bool,
    pub manage_semaphores: bool,
    pub get_semaphores: bool,
}

impl Permissions {
    /// Everything allowed.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            add_agent: true,
            remove_agent: true,
            remove_client: true,
            set_active: true,
            get_map: true,
            get_agent_ids: true,
            get_agent_states: true,
            manage_semaphores: true,
            get_semaphores: true,
        }
    }

    /// Nothing beyond driving the client's own agents.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            add_agent: false,
            remove_agent: false,
            remove_client: false,
            set_active: false,
            get_map: false,
            get_agent_ids: false,
            get_agent_states: false,
            manage_semaphores: false,
            get_semaphores: false,
        }
    }
}

/// Handshake sent by a client immediately after connecting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hello {
    /// Present when reconnecting to reclaim a previous session's agents.
    pub reconnect_client_id: Option<u64>,
}

/// Handshake reply from the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Welcome {
    pub client_id: u64,
    /// Agents owned by this client (non-empty after a reconnect).
    pub agent_ids: Vec<u64>,
    pub simulator_tick: u64,
}

/// A client request, correlated with its response by `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestEnvelope {
    pub request_id: u64,
    pub request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Request {
    AddAgent,
    RemoveAgent {
        agent_id: u64,
    },
    AddSemaphore,
    RemoveSemaphore {
        semaphore_id: u64,
    },
    SignalSemaphore {
        semaphore_id: u64,
    },
    UnsignalSemaphore {
        semaphore_id: u64,
    },
    GetSemaphores,
    Move {
        agent_id: u64,
        direction: Direction,
        num_steps: u32,
    },
    Turn {
        agent_id: u64,
        direction: Direction,
    },
    NoOp {
        agent_id: u64,
    },
    GetMap {
        bottom_left: Position,
        top_right: Position,
        want_scent: bool,
        want_vision: bool,
    },
    GetAgentIds,
    GetAgentStates {
        agent_ids: Vec<u64>,
    },
    SetActive {
        agent_id: u64,
        active: bool,
    },
    IsActive {
        agent_id: u64,
    },
}

/// Patch contents in a map response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatchReply {
    pub position: Position,
    pub fixed: bool,
    pub items: Vec<ItemInstance>,
    pub scent: Option<Vec<f32>>,
    pub colors: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Response {
    AgentAdded {
        status: Status,
        agent: Option<AgentState>,
    },
    AgentRemoved {
        status: Status,
    },
    SemaphoreAdded {
        status: Status,
        semaphore_id: Option<u64>,
    },
    SemaphoreRemoved {
        status: Status,
    },
    SemaphoreSignaled {
        status: Status,
    },
    SemaphoreUnsignaled {
        status: Status,
    },
    Semaphores {
        status: Status,
        semaphores: Vec<(u64, bool)>,
    },
    Acted {
        status: Status,
    },
    Map {
        status: Status,
        patches: Vec<PatchReply>,
    },
    AgentIds {
        status: Status,
        agent_ids: Vec<u64>,
    },
    AgentStates {
        status: Status,
        agents: Vec<Option<AgentState>>,
    },
    ActiveSet {
        status: Status,
    },
    Active {
        status: Status,
        active: bool,
    },
}

/// Any frame the server sends. `Step` and `LostConnection` arrive
/// unsolicited; `Reply` answers a specific request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ServerMessage {
    Welcome(Welcome),
    Reply {
        request_id: u64,
        response: Response,
    },
    /// Per-tick broadcast with the stepped agents owned by (or visible to)
    /// the receiving client.
    Step {
        tick: u64,
        agents: Vec<AgentState>,
    },
    /// The server is dropping this client.
    LostConnection,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_round_trips_through_json() {
        let envelope = RequestEnvelope {
            request_id: 7,
            request: Request::Move {
                agent_id: 3,
                direction: Direction::Left,
                num_steps: 2,
            },
        };
        let json = serde_json::to_string(&envelope).expect("serialize");
        let back: RequestEnvelope = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, envelope);
    }

    #[test]
    fn status_maps_from_simulator_errors() {
        assert_eq!(
            Status::from(&SimulatorError::InvalidAgentId(3)),
            Status::InvalidAgentId
        );
        assert_eq!(
            Status::from(&SimulatorError::ActionAlreadyQueued(3)),
            Status::OutOfRange
        );
        assert_eq!(
            Status::from(&SimulatorError::OutOfRange("steps")),
            Status::OutOfRange
        );
    }

    #[test]
    fn server_messages_round_trip_through_json() {
        let message = ServerMessage::Step {
            tick: 12,
            agents: Vec::new(),
        };
        let json = serde_json::to_string(&message).expect("serialize");
        let back: ServerMessage = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, message);
    }

    #[test]
    fn default_permission_profiles() {
        assert!(Permissions::all().get_map);
        assert!(!Permissions::none().add_agent);
    }
}
