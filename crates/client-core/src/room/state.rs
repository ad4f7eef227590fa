use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::presence::{SharedUser, snapshot_user};

/// Normalised room membership. Wire `"leave"` (and empty member content)
/// maps to the member being absent rather than to a variant here.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Invite,
    Join,
}

impl Membership {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invite => "invite",
            Self::Join => "join",
        }
    }
}

/// Room-local view of a user: a shared handle to the global record plus
/// the fields the room's member event carried.
#[derive(Debug, Clone)]
pub struct Member {
    pub user_id: String,
    pub user: SharedUser,
    pub displayname: Option<String>,
    pub membership: Option<Membership>,
}

impl Member {
    pub fn snapshot(&self) -> MemberSnapshot {
        MemberSnapshot {
            user_id: self.user_id.clone(),
            displayname: self.displayname.clone(),
            membership: self.membership,
        }
    }
}

/// Point-in-time copy of a member carried in notices.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberSnapshot {
    pub user_id: String,
    pub displayname: Option<String>,
    pub membership: Option<Membership>,
}

impl MemberSnapshot {
    /// Synthetic snapshot for a user the room has no member record for.
    pub fn bare(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            displayname: None,
            membership: None,
        }
    }
}

/// One direction's state projection for a room.
///
/// The forward instance carries everything; a backward instance only
/// evolves its member and alias maps while rewinding history.
#[derive(Debug, Clone, Default)]
pub struct RoomState {
    pub name: Option<String>,
    pub topic: Option<String>,
    pub join_rule: Option<String>,
    pub(crate) aliases_by_hs: BTreeMap<String, Vec<String>>,
    pub(crate) level_by_userid: BTreeMap<String, i64>,
    pub(crate) levels: BTreeMap<String, i64>,
    pub(crate) members: BTreeMap<String, Member>,
}

impl RoomState {
    pub fn member(&self, user_id: &str) -> Option<&Member> {
        self.members.get(user_id)
    }

    pub(crate) fn member_mut(&mut self, user_id: &str) -> Option<&mut Member> {
        self.members.get_mut(user_id)
    }

    pub(crate) fn insert_member(&mut self, member: Member) {
        self.members.insert(member.user_id.clone(), member);
    }

    pub(crate) fn remove_member(&mut self, user_id: &str) -> Option<Member> {
        self.members.remove(user_id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn member_ids(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    pub fn members(&self) -> Vec<MemberSnapshot> {
        self.members.values().map(Member::snapshot).collect()
    }

    /// Snapshot a member together with the current shared user record.
    pub fn member_snapshot(&self, user_id: &str) -> Option<MemberSnapshot> {
        self.members.get(user_id).map(|member| {
            let user = snapshot_user(&member.user);
            MemberSnapshot {
                user_id: member.user_id.clone(),
                displayname: member.displayname.clone().or(user.displayname),
                membership: member.membership,
            }
        })
    }

    /// Effective power level: user-specific entry, else the `default` one.
    pub fn member_level(&self, user_id: &str) -> Option<i64> {
        self.level_by_userid
            .get(user_id)
            .or_else(|| self.level_by_userid.get("default"))
            .copied()
    }

    /// Threshold for a named action (`send_event`, `add_state`, `ban`,
    /// `kick`, `redact`), when known.
    pub fn action_level(&self, action: &str) -> Option<i64> {
        self.levels.get(action).copied()
    }

    /// Per-user levels including the `default` sentinel entry.
    pub fn levels_by_userid(&self) -> &BTreeMap<String, i64> {
        &self.level_by_userid
    }

    /// Thresholds for every known action.
    pub fn action_levels(&self) -> &BTreeMap<String, i64> {
        &self.levels
    }

    /// All aliases across home servers, concatenated.
    pub fn aliases(&self) -> Vec<String> {
        self.aliases_by_hs.values().flatten().cloned().collect()
    }

    /// Aliases of every home server except `hs`.
    pub(crate) fn aliases_excluding(&self, hs: &str) -> Vec<String> {
        self.aliases_by_hs
            .iter()
            .filter(|(other, _)| other.as_str() != hs)
            .flat_map(|(_, aliases)| aliases.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::UserRegistry;

    fn member(registry: &mut UserRegistry, user_id: &str) -> Member {
        Member {
            user_id: user_id.to_owned(),
            user: registry.get_or_create(user_id),
            displayname: None,
            membership: Some(Membership::Join),
        }
    }

    #[test]
    fn resolves_member_level_through_default() {
        let mut state = RoomState::default();
        state.level_by_userid.insert("default".to_owned(), 0);
        state.level_by_userid.insert("@a:hs".to_owned(), 50);

        assert_eq!(state.member_level("@a:hs"), Some(50));
        assert_eq!(state.member_level("@b:hs"), Some(0));
    }

    #[test]
    fn returns_none_without_default_level() {
        let state = RoomState::default();
        assert_eq!(state.member_level("@a:hs"), None);
    }

    #[test]
    fn concatenates_aliases_across_home_servers() {
        let mut state = RoomState::default();
        state
            .aliases_by_hs
            .insert("hs1".to_owned(), vec!["#a:hs1".to_owned()]);
        state.aliases_by_hs.insert(
            "hs2".to_owned(),
            vec!["#a:hs2".to_owned(), "#b:hs2".to_owned()],
        );

        let mut aliases = state.aliases();
        aliases.sort();
        assert_eq!(aliases, vec!["#a:hs1", "#a:hs2", "#b:hs2"]);
        assert_eq!(state.aliases_excluding("hs2"), vec!["#a:hs1"]);
    }

    #[test]
    fn cloned_projection_shares_user_handles() {
        let mut registry = UserRegistry::default();
        let mut state = RoomState::default();
        state.insert_member(member(&mut registry, "@a:hs"));

        let copy = state.clone();
        let original = state.member("@a:hs").expect("member should exist");
        let cloned = copy.member("@a:hs").expect("cloned member should exist");
        assert!(std::sync::Arc::ptr_eq(&original.user, &cloned.user));
    }
}
