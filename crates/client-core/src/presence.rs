use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::ClientError,
    event::EventEnvelope,
    notice::{Changes, change_pair},
};

/// Presence state of a remote user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Offline,
    Unavailable,
    Online,
}

impl Presence {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "offline" => Some(Self::Offline),
            "unavailable" => Some(Self::Unavailable),
            "online" => Some(Self::Online),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Unavailable => "unavailable",
            Self::Online => "online",
        }
    }
}

/// Globally shared user record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub user_id: String,
    pub displayname: Option<String>,
    pub presence: Option<Presence>,
    /// Wall-clock seconds of the user's last observed activity.
    pub last_active: Option<u64>,
}

impl User {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            displayname: None,
            presence: None,
            last_active: None,
        }
    }
}

/// Shared owner handle for a [`User`]; members hold clones of this.
pub type SharedUser = Arc<RwLock<User>>;

/// Point-in-time copy of a user record carried in notices.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSnapshot {
    pub user_id: String,
    pub displayname: Option<String>,
    pub presence: Option<Presence>,
    pub last_active: Option<u64>,
}

/// Snapshot a shared user record, recovering from a poisoned lock.
pub fn snapshot_user(user: &SharedUser) -> UserSnapshot {
    let user = user.read().unwrap_or_else(PoisonError::into_inner);
    UserSnapshot {
        user_id: user.user_id.clone(),
        displayname: user.displayname.clone(),
        presence: user.presence,
        last_active: user.last_active,
    }
}

/// user-id → shared user record, created on first reference.
#[derive(Debug, Default)]
pub struct UserRegistry {
    users: HashMap<String, SharedUser>,
}

impl UserRegistry {
    pub fn get(&self, user_id: &str) -> Option<SharedUser> {
        self.users.get(user_id).cloned()
    }

    pub fn get_or_create(&mut self, user_id: &str) -> SharedUser {
        self.users
            .entry(user_id.to_owned())
            .or_insert_with(|| Arc::new(RwLock::new(User::new(user_id))))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Fold an `m.presence` event into the global user record.
///
/// Returns the updated snapshot plus the change delta over `presence` and
/// `displayname`. `last_active` is refreshed but not reported as a change.
pub fn fold_presence(
    registry: &mut UserRegistry,
    envelope: &EventEnvelope,
) -> Result<(UserSnapshot, Changes), ClientError> {
    let user_id = envelope
        .content_str("user_id")
        .ok_or_else(|| ClientError::protocol("presence event without content.user_id"))?
        .to_owned();

    let presence = match envelope.content.get("presence") {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) => Some(Presence::parse(raw).ok_or_else(|| {
            ClientError::protocol(format!("unknown presence state '{raw}'"))
        })?),
        Some(other) => {
            return Err(ClientError::protocol(format!(
                "presence field of unexpected type: {other}"
            )));
        }
    };
    let displayname = envelope.content_str("displayname").map(str::to_owned);
    let last_active_ago_ms = envelope.content.get("last_active_ago").and_then(Value::as_u64);

    let shared = registry.get_or_create(&user_id);
    let mut changes = Changes::new();
    {
        let mut user = shared.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(presence) = presence
            && user.presence != Some(presence)
        {
            changes.insert(
                "presence".to_owned(),
                change_pair(
                    user.presence.map_or(Value::Null, |p| p.as_str().into()),
                    presence.as_str().into(),
                ),
            );
            user.presence = Some(presence);
        }

        if let Some(displayname) = displayname
            && user.displayname.as_deref() != Some(displayname.as_str())
        {
            changes.insert(
                "displayname".to_owned(),
                change_pair(
                    user.displayname.as_deref().map_or(Value::Null, Value::from),
                    displayname.as_str().into(),
                ),
            );
            user.displayname = Some(displayname);
        }

        if let Some(ago_ms) = last_active_ago_ms {
            user.last_active = Some(now_secs().saturating_sub(ago_ms / 1_000));
        }
    }

    Ok((snapshot_user(&shared), changes))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn presence_event(content: Value) -> EventEnvelope {
        EventEnvelope::from_value(json!({"type": "m.presence", "content": content}))
            .expect("presence envelope should parse")
    }

    #[test]
    fn creates_user_on_first_reference() {
        let mut registry = UserRegistry::default();
        assert!(registry.get("@alice:example.org").is_none());

        let shared = registry.get_or_create("@alice:example.org");
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(
            &shared,
            &registry.get_or_create("@alice:example.org")
        ));
    }

    #[test]
    fn reports_presence_and_displayname_changes() {
        let mut registry = UserRegistry::default();
        let (_, first) = fold_presence(
            &mut registry,
            &presence_event(json!({
                "user_id": "@alice:example.org",
                "presence": "online",
                "displayname": "Alice",
            })),
        )
        .expect("first fold should work");
        assert_eq!(first["presence"], vec![json!(null), json!("online")]);
        assert_eq!(first["displayname"], vec![json!(null), json!("Alice")]);

        let (snapshot, second) = fold_presence(
            &mut registry,
            &presence_event(json!({
                "user_id": "@alice:example.org",
                "presence": "unavailable",
                "displayname": "Alice",
            })),
        )
        .expect("second fold should work");
        assert_eq!(
            second["presence"],
            vec![json!("online"), json!("unavailable")]
        );
        assert!(!second.contains_key("displayname"));
        assert_eq!(snapshot.presence, Some(Presence::Unavailable));
    }

    #[test]
    fn refreshes_last_active_without_reporting_it() {
        let mut registry = UserRegistry::default();
        let (snapshot, changes) = fold_presence(
            &mut registry,
            &presence_event(json!({
                "user_id": "@alice:example.org",
                "presence": "online",
                "last_active_ago": 5_000,
            })),
        )
        .expect("fold should work");

        assert!(snapshot.last_active.is_some());
        assert!(!changes.contains_key("last_active"));
    }

    #[test]
    fn rejects_unknown_presence_state() {
        let mut registry = UserRegistry::default();
        let err = fold_presence(
            &mut registry,
            &presence_event(json!({
                "user_id": "@alice:example.org",
                "presence": "away",
            })),
        )
        .expect_err("unknown presence should fail");
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[test]
    fn rejects_presence_without_user_id() {
        let mut registry = UserRegistry::default();
        let err = fold_presence(&mut registry, &presence_event(json!({"presence": "online"})))
            .expect_err("missing user_id should fail");
        assert!(matches!(err, ClientError::Protocol(_)));
    }
}
