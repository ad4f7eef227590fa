use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::{
    error::ClientError,
    event::EventEnvelope,
    lifecycle::ClientPhase,
    presence::UserSnapshot,
    room::state::MemberSnapshot,
};

/// Traversal direction of the fold that produced a room notice.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
}

/// field → `[slot0, slot1]`, where slot 1 always holds the value in the
/// direction of traversal (the new value forwards, the older value when
/// rewinding). The `aliases` key carries a third slot with the other
/// home servers' aliases.
pub type Changes = BTreeMap<String, Vec<Value>>;

/// Build a two-slot change pair in traversal order.
pub fn change_pair(departed: Value, arrived: Value) -> Vec<Value> {
    vec![departed, arrived]
}

/// Client-level notice.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub enum ClientNotice {
    /// The lifecycle machine transitioned.
    Lifecycle { phase: ClientPhase },
    /// A room was added to the registry.
    RoomNew { room_id: String },
    /// A room was removed from the registry (self-leave).
    RoomDel { room_id: String },
    /// The local user was invited to a room we are not in.
    Invite { event: EventEnvelope },
    /// A remote user's presence changed.
    Presence {
        user: UserSnapshot,
        changes: Changes,
    },
    /// An event with no registered handler.
    UnknownEvent { event: EventEnvelope },
    /// A non-retried failure observers may care about.
    Error {
        error: ClientError,
        context: String,
    },
}

/// Room-level notice. Member payloads are snapshots taken at fold time.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub enum RoomNotice {
    /// Initial state for the room has been fully folded. Emitted exactly
    /// once per room, before any streaming notice for it.
    SyncedState { room_id: String },
    Message {
        room_id: String,
        direction: Direction,
        member: MemberSnapshot,
        content: Value,
        event: EventEnvelope,
    },
    Membership {
        room_id: String,
        direction: Direction,
        actor: Option<MemberSnapshot>,
        subject: MemberSnapshot,
        changes: Changes,
        event: EventEnvelope,
    },
    StateChanged {
        room_id: String,
        direction: Direction,
        actor: Option<MemberSnapshot>,
        changes: Changes,
        event: EventEnvelope,
    },
    Presence {
        room_id: String,
        member: MemberSnapshot,
        changes: Changes,
    },
}

impl RoomNotice {
    /// Room the notice belongs to.
    pub fn room_id(&self) -> &str {
        match self {
            Self::SyncedState { room_id }
            | Self::Message { room_id, .. }
            | Self::Membership { room_id, .. }
            | Self::StateChanged { room_id, .. }
            | Self::Presence { room_id, .. } => room_id,
        }
    }
}

/// Any notice observable through the hub.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub enum Notice {
    Client(ClientNotice),
    Room(RoomNotice),
}
