//! Protocol-agnostic core of the Matrix v1 client.
//!
//! This crate defines the event envelope and dispatcher, the per-room state
//! folding engine with its forward and backward projections, the user and
//! presence model, the client lifecycle machine, and the notice types
//! observers consume. It performs no I/O; the wire layer lives in
//! `client-matrix`.

/// Dotted-type handler registry and room-target selection.
pub mod dispatch;
/// Stable client error types and HTTP status classification helpers.
pub mod error;
/// Generic wire event envelope.
pub mod event;
/// Broadcast fan-out of notices to observers.
pub mod hub;
/// Client lifecycle state machine.
pub mod lifecycle;
/// Notice payloads and the change-pair convention.
pub mod notice;
/// Global user records, registry, and presence folding.
pub mod presence;
/// Backoff policy used by retry loops.
pub mod retry;
/// Room state projections and the event folding engine.
pub mod room;

pub use dispatch::{Dispatcher, Handler, RoomEventKind, RoomTarget, select_room_target};
pub use error::{ClientError, StatusClass, classify_http_status};
pub use event::EventEnvelope;
pub use hub::{NoticeHub, NoticeStream};
pub use lifecycle::{ClientPhase, LifecycleMachine};
pub use notice::{Changes, ClientNotice, Direction, Notice, RoomNotice, change_pair};
pub use presence::{
    Presence, SharedUser, User, UserRegistry, UserSnapshot, fold_presence, snapshot_user,
};
pub use retry::PollBackoff;
pub use room::fold::{FoldOutcome, FoldPhase, PaginationToken, RoomEngine};
pub use room::state::{Member, MemberSnapshot, Membership, RoomState};
