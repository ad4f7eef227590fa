use std::collections::HashMap;

/// Room-scoped event kinds the state engine folds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomEventKind {
    Name,
    Topic,
    JoinRules,
    Aliases,
    Member,
    Message,
    Create,
    PowerLevels,
    OpsLevels,
    SendEventLevel,
    AddStateLevel,
}

/// Handler targets resolvable from a dotted event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Room(RoomEventKind),
    Presence,
}

/// Where a room-scoped event should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomTarget {
    /// The room is in the registry; fold through its engine.
    KnownRoom,
    /// Unknown room but the local user is the subject (an invite or
    /// similar self-targeted state); handle at client scope.
    SelfScoped,
    /// Nothing to deliver to; drop with a warning.
    Drop,
}

/// Apply the room-target selection rules in order.
pub fn select_room_target(
    room_known: bool,
    state_key: Option<&str>,
    local_user: &str,
) -> RoomTarget {
    if room_known {
        RoomTarget::KnownRoom
    } else if state_key == Some(local_user) {
        RoomTarget::SelfScoped
    } else {
        RoomTarget::Drop
    }
}

/// Dotted-type handler registry.
///
/// Resolution splits the type on `.` and finds the handler registered for
/// the longest matching prefix; unmatched trailing parts are returned as
/// suffix arguments.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    handlers: HashMap<String, Handler>,
}

impl Dispatcher {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry preloaded with every event type the engine understands.
    pub fn with_default_handlers() -> Self {
        use RoomEventKind::*;

        let mut dispatcher = Self::new();
        dispatcher.register("m.presence", Handler::Presence);
        dispatcher.register("m.room.name", Handler::Room(Name));
        dispatcher.register("m.room.topic", Handler::Room(Topic));
        dispatcher.register("m.room.join_rules", Handler::Room(JoinRules));
        dispatcher.register("m.room.aliases", Handler::Room(Aliases));
        dispatcher.register("m.room.member", Handler::Room(Member));
        dispatcher.register("m.room.message", Handler::Room(Message));
        dispatcher.register("m.room.create", Handler::Room(Create));
        dispatcher.register("m.room.power_levels", Handler::Room(PowerLevels));
        dispatcher.register("m.room.ops_levels", Handler::Room(OpsLevels));
        dispatcher.register("m.room.send_event_level", Handler::Room(SendEventLevel));
        dispatcher.register("m.room.add_state_level", Handler::Room(AddStateLevel));
        dispatcher
    }

    pub fn register(&mut self, name: &str, handler: Handler) {
        self.handlers.insert(name.to_owned(), handler);
    }

    /// Resolve a dotted type to its handler and any unmatched suffix parts.
    pub fn resolve<'a>(&self, event_type: &'a str) -> Option<(Handler, Vec<&'a str>)> {
        let parts: Vec<&str> = event_type.split('.').collect();
        for prefix_len in (1..=parts.len()).rev() {
            let key = parts[..prefix_len].join(".");
            if let Some(handler) = self.handlers.get(&key) {
                return Some((*handler, parts[prefix_len..].to_vec()));
            }
        }
        None
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::with_default_handlers()
    }
}
