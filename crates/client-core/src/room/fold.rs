use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    dispatch::RoomEventKind,
    error::ClientError,
    event::EventEnvelope,
    notice::{Changes, Direction, RoomNotice, change_pair},
    presence::UserRegistry,
    room::state::{Member, MemberSnapshot, Membership, RoomState},
};

/// Which folding rules apply to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldPhase {
    /// Snapshot state from `initialSync`; mutate silently.
    Initial,
    /// Live streamed event; mutate the forward projection and notify.
    Forward,
    /// Paginated history event; mutate the backward projection and notify.
    Backward,
}

/// Position of the backward-pagination cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaginationToken {
    /// No page fetched yet; the next request starts from `END`.
    Unset,
    /// Opaque server token for the next older page.
    At(String),
    /// The room-create event was seen; history is exhausted.
    Start,
}

/// Result of folding one event.
#[derive(Debug, Default)]
pub struct FoldOutcome {
    pub notices: Vec<RoomNotice>,
    /// The local user's membership resolved to absent; the caller must
    /// deregister the room after emitting the notices.
    pub self_left: bool,
}

/// Per-room state machine folding typed events into a live forward
/// projection and, once pagination starts, an independent backward one.
#[derive(Debug)]
pub struct RoomEngine {
    room_id: String,
    local_user_id: String,
    forward: RoomState,
    backward: Option<RoomState>,
    pagination: PaginationToken,
    synced: bool,
}

impl RoomEngine {
    pub fn new(room_id: impl Into<String>, local_user_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            local_user_id: local_user_id.into(),
            forward: RoomState::default(),
            backward: None,
            pagination: PaginationToken::Unset,
            synced: false,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Current live state.
    pub fn state(&self) -> &RoomState {
        &self.forward
    }

    /// Rewind-side state, present once pagination has started.
    pub fn back_state(&self) -> Option<&RoomState> {
        self.backward.as_ref()
    }

    pub fn pagination_token(&self) -> &PaginationToken {
        &self.pagination
    }

    /// Record that initial state has been folded. True only the first time.
    pub fn mark_synced(&mut self) -> bool {
        !std::mem::replace(&mut self.synced, true)
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Begin a pagination request: returns the `from` token for the wire,
    /// lazily cloning the backward projection on first use.
    ///
    /// Fails locally once the room-create event has been seen; no network
    /// traffic may follow a [`ClientError::PaginationExhausted`].
    pub fn begin_pagination(&mut self) -> Result<String, ClientError> {
        let from = match &self.pagination {
            PaginationToken::Start => return Err(ClientError::PaginationExhausted),
            PaginationToken::Unset => "END".to_owned(),
            PaginationToken::At(token) => token.clone(),
        };

        if self.backward.is_none() {
            let mut back = RoomState::default();
            back.members = self.forward.members.clone();
            back.aliases_by_hs = self.forward.aliases_by_hs.clone();
            self.backward = Some(back);
        }
        Ok(from)
    }

    /// Advance the cursor after a pagination response, unless the chunk
    /// already walked past the room-create event.
    pub fn finish_pagination(&mut self, end: impl Into<String>) {
        if self.pagination != PaginationToken::Start {
            self.pagination = PaginationToken::At(end.into());
        }
    }

    /// Fold one resolved event in the given phase.
    ///
    /// Folding never fails: malformed events are logged and skipped so a
    /// single bad event cannot jam the stream.
    pub fn fold(
        &mut self,
        kind: RoomEventKind,
        phase: FoldPhase,
        users: &mut UserRegistry,
        envelope: &EventEnvelope,
        suffix: &[&str],
    ) -> FoldOutcome {
        if !suffix.is_empty() {
            debug!(
                room = %self.room_id,
                event_type = %envelope.event_type,
                ?suffix,
                "unhandled event subtype; folding under its prefix handler"
            );
        }

        match kind {
            RoomEventKind::Name => self.fold_scalar("name", phase, envelope),
            RoomEventKind::Topic => self.fold_scalar("topic", phase, envelope),
            RoomEventKind::JoinRules => self.fold_scalar("join_rule", phase, envelope),
            RoomEventKind::Aliases => self.fold_aliases(phase, envelope),
            RoomEventKind::Member => self.fold_member(phase, users, envelope),
            RoomEventKind::Message => self.fold_message(phase, envelope),
            RoomEventKind::Create => self.fold_create(phase),
            RoomEventKind::PowerLevels => self.fold_power_levels(phase, envelope),
            RoomEventKind::OpsLevels => self.fold_action_levels(
                phase,
                envelope,
                &[
                    ("ban_level", "ban"),
                    ("kick_level", "kick"),
                    ("redact_level", "redact"),
                ],
            ),
            RoomEventKind::SendEventLevel => {
                self.fold_action_levels(phase, envelope, &[("level", "send_event")])
            }
            RoomEventKind::AddStateLevel => {
                self.fold_action_levels(phase, envelope, &[("level", "add_state")])
            }
        }
    }

    fn fold_scalar(
        &mut self,
        field: &'static str,
        phase: FoldPhase,
        envelope: &EventEnvelope,
    ) -> FoldOutcome {
        let event_value = envelope.content_str(field).map(str::to_owned);
        let mut outcome = FoldOutcome::default();

        match phase {
            FoldPhase::Initial => {
                *scalar_slot(&mut self.forward, field) = event_value;
            }
            FoldPhase::Forward => {
                let actor = actor_from(&self.forward, envelope);
                let slot = scalar_slot(&mut self.forward, field);
                let old = slot.take();
                *slot = event_value.clone();

                let mut changes = Changes::new();
                changes.insert(
                    field.to_owned(),
                    change_pair(opt_str_value(old.as_deref()), opt_str_value(event_value.as_deref())),
                );
                outcome.notices.push(RoomNotice::StateChanged {
                    room_id: self.room_id.clone(),
                    direction: Direction::Forward,
                    actor,
                    changes,
                    event: envelope.clone(),
                });
            }
            FoldPhase::Backward => {
                // Scalars are not carried on the backward projection;
                // only the traversal pair is reported.
                let arrived = envelope
                    .prev_content
                    .as_ref()
                    .and_then(|prev| prev.get(field))
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                let actor = self
                    .backward
                    .as_ref()
                    .and_then(|back| actor_from(back, envelope));

                let mut changes = Changes::new();
                changes.insert(
                    field.to_owned(),
                    change_pair(
                        opt_str_value(event_value.as_deref()),
                        opt_str_value(arrived.as_deref()),
                    ),
                );
                outcome.notices.push(RoomNotice::StateChanged {
                    room_id: self.room_id.clone(),
                    direction: Direction::Backward,
                    actor,
                    changes,
                    event: envelope.clone(),
                });
            }
        }
        outcome
    }

    fn fold_aliases(&mut self, phase: FoldPhase, envelope: &EventEnvelope) -> FoldOutcome {
        let Some(hs) = envelope.state_key.as_deref() else {
            warn!(room = %self.room_id, "aliases event without home-server state_key dropped");
            return FoldOutcome::default();
        };
        let Some(event_list) = string_list(envelope.content.get("aliases")) else {
            warn!(room = %self.room_id, "aliases event without alias list dropped");
            return FoldOutcome::default();
        };
        let mut outcome = FoldOutcome::default();

        match phase {
            FoldPhase::Initial => {
                self.forward
                    .aliases_by_hs
                    .insert(hs.to_owned(), event_list);
            }
            FoldPhase::Forward => {
                let actor = actor_from(&self.forward, envelope);
                let old = self
                    .forward
                    .aliases_by_hs
                    .insert(hs.to_owned(), event_list.clone())
                    .unwrap_or_default();
                let others = self.forward.aliases_excluding(hs);

                let mut changes = Changes::new();
                changes.insert(
                    "aliases".to_owned(),
                    vec![Value::from(old), Value::from(event_list), Value::from(others)],
                );
                outcome.notices.push(RoomNotice::StateChanged {
                    room_id: self.room_id.clone(),
                    direction: Direction::Forward,
                    actor,
                    changes,
                    event: envelope.clone(),
                });
            }
            FoldPhase::Backward => {
                let Some(back) = self.backward.as_mut() else {
                    warn!(room = %self.room_id, "backward aliases fold without backward projection");
                    return outcome;
                };
                let arrived = envelope
                    .prev_content
                    .as_ref()
                    .and_then(|prev| string_list(prev.get("aliases")))
                    .unwrap_or_default();
                let departed = back
                    .aliases_by_hs
                    .get(hs)
                    .cloned()
                    .unwrap_or_else(|| event_list.clone());
                if arrived.is_empty() {
                    back.aliases_by_hs.remove(hs);
                } else {
                    back.aliases_by_hs.insert(hs.to_owned(), arrived.clone());
                }
                let others = back.aliases_excluding(hs);
                let actor = actor_from(back, envelope);

                let mut changes = Changes::new();
                changes.insert(
                    "aliases".to_owned(),
                    vec![Value::from(departed), Value::from(arrived), Value::from(others)],
                );
                outcome.notices.push(RoomNotice::StateChanged {
                    room_id: self.room_id.clone(),
                    direction: Direction::Backward,
                    actor,
                    changes,
                    event: envelope.clone(),
                });
            }
        }
        outcome
    }

    fn fold_member(
        &mut self,
        phase: FoldPhase,
        users: &mut UserRegistry,
        envelope: &EventEnvelope,
    ) -> FoldOutcome {
        let Some(subject_id) = envelope.state_key.clone() else {
            warn!(room = %self.room_id, "member event without state_key dropped");
            return FoldOutcome::default();
        };

        match phase {
            FoldPhase::Initial => {
                if self.forward.member(&subject_id).is_some() {
                    warn!(
                        room = %self.room_id,
                        user = %subject_id,
                        "duplicate member on initial sync ignored"
                    );
                    return FoldOutcome::default();
                }
                let side = match normalize_member_side(Some(&envelope.content)) {
                    Ok(side) => side,
                    Err(err) => {
                        warn!(room = %self.room_id, error = %err, "member event dropped");
                        return FoldOutcome::default();
                    }
                };
                if side.membership.is_some() {
                    let user = users.get_or_create(&subject_id);
                    self.forward.insert_member(Member {
                        user_id: subject_id,
                        user,
                        displayname: side.displayname,
                        membership: side.membership,
                    });
                }
                FoldOutcome::default()
            }
            FoldPhase::Forward => {
                self.fold_member_directed(Direction::Forward, users, envelope, &subject_id)
            }
            FoldPhase::Backward => {
                self.fold_member_directed(Direction::Backward, users, envelope, &subject_id)
            }
        }
    }

    fn fold_member_directed(
        &mut self,
        direction: Direction,
        users: &mut UserRegistry,
        envelope: &EventEnvelope,
        subject_id: &str,
    ) -> FoldOutcome {
        // Sides in traversal order: rewinding departs from `content` and
        // arrives at `prev_content`.
        let (departed_raw, arrived_raw) = match direction {
            Direction::Forward => (envelope.prev_content.as_ref(), Some(&envelope.content)),
            Direction::Backward => (Some(&envelope.content), envelope.prev_content.as_ref()),
        };
        let sides = normalize_member_side(departed_raw)
            .and_then(|departed| Ok((departed, normalize_member_side(arrived_raw)?)));
        let (departed, arrived) = match sides {
            Ok(sides) => sides,
            Err(err) => {
                warn!(room = %self.room_id, error = %err, "member event dropped");
                return FoldOutcome::default();
            }
        };

        let room_id = self.room_id.clone();
        let projection = match direction {
            Direction::Forward => &mut self.forward,
            Direction::Backward => match self.backward.as_mut() {
                Some(back) => back,
                None => {
                    warn!(room = %room_id, "backward member fold without backward projection");
                    return FoldOutcome::default();
                }
            },
        };

        if projection.member(subject_id).is_none() {
            let user = users.get_or_create(subject_id);
            projection.insert_member(Member {
                user_id: subject_id.to_owned(),
                user,
                displayname: None,
                membership: None,
            });
        }

        let mut changes = Changes::new();
        let Some(member) = projection.member_mut(subject_id) else {
            return FoldOutcome::default();
        };
        if departed.membership != arrived.membership {
            changes.insert(
                "membership".to_owned(),
                change_pair(
                    membership_value(departed.membership),
                    membership_value(arrived.membership),
                ),
            );
        }
        if departed.displayname != arrived.displayname {
            changes.insert(
                "displayname".to_owned(),
                change_pair(
                    opt_str_value(departed.displayname.as_deref()),
                    opt_str_value(arrived.displayname.as_deref()),
                ),
            );
        }
        member.membership = arrived.membership;
        member.displayname = arrived.displayname.clone();
        let subject = member.snapshot();

        let actor = envelope.user_id.as_deref().map(|actor_id| {
            projection
                .member(actor_id)
                .map(Member::snapshot)
                .unwrap_or_else(|| MemberSnapshot::bare(actor_id))
        });

        if arrived.membership.is_none() {
            projection.remove_member(subject_id);
        }

        let mut outcome = FoldOutcome::default();
        outcome.self_left = direction == Direction::Forward
            && arrived.membership.is_none()
            && subject_id == self.local_user_id;
        outcome.notices.push(RoomNotice::Membership {
            room_id,
            direction,
            actor,
            subject,
            changes,
            event: envelope.clone(),
        });
        outcome
    }

    fn fold_message(&mut self, phase: FoldPhase, envelope: &EventEnvelope) -> FoldOutcome {
        let direction = match phase {
            FoldPhase::Initial => return FoldOutcome::default(),
            FoldPhase::Forward => Direction::Forward,
            FoldPhase::Backward => Direction::Backward,
        };
        let projection = match direction {
            Direction::Forward => Some(&self.forward),
            Direction::Backward => self.backward.as_ref(),
        };
        let Some(projection) = projection else {
            warn!(room = %self.room_id, "backward message fold without backward projection");
            return FoldOutcome::default();
        };
        let Some(author_id) = envelope.user_id.as_deref() else {
            warn!(room = %self.room_id, "message without user_id dropped");
            return FoldOutcome::default();
        };
        let Some(member) = projection.member(author_id) else {
            warn!(
                room = %self.room_id,
                user = %author_id,
                "message from unknown member dropped"
            );
            return FoldOutcome::default();
        };

        let mut outcome = FoldOutcome::default();
        outcome.notices.push(RoomNotice::Message {
            room_id: self.room_id.clone(),
            direction,
            member: member.snapshot(),
            content: envelope.content.clone(),
            event: envelope.clone(),
        });
        outcome
    }

    fn fold_create(&mut self, phase: FoldPhase) -> FoldOutcome {
        if phase == FoldPhase::Backward {
            debug!(room = %self.room_id, "room create reached; history exhausted");
            self.pagination = PaginationToken::Start;
        }
        FoldOutcome::default()
    }

    fn fold_power_levels(&mut self, phase: FoldPhase, envelope: &EventEnvelope) -> FoldOutcome {
        match phase {
            FoldPhase::Backward => {
                debug!(room = %self.room_id, "power-level events are not folded backwards");
                FoldOutcome::default()
            }
            FoldPhase::Initial => {
                let (users_map, actions) = split_power_content(&envelope.content);
                self.forward.level_by_userid = users_map;
                self.forward.levels.extend(actions);
                FoldOutcome::default()
            }
            FoldPhase::Forward => {
                let (new_users, new_actions) = split_power_content(&envelope.content);
                let old_users = match envelope.prev_content.as_ref() {
                    Some(prev) => split_power_content(prev).0,
                    None => self.forward.level_by_userid.clone(),
                };
                let actor = actor_from(&self.forward, envelope);
                let mut outcome = FoldOutcome::default();

                let mut state_changes = Changes::new();
                for (action, new_level) in &new_actions {
                    let old = self.forward.levels.insert(action.clone(), *new_level);
                    if old != Some(*new_level) {
                        state_changes.insert(
                            format!("level.{action}"),
                            change_pair(opt_i64_value(old), (*new_level).into()),
                        );
                    }
                }
                if !state_changes.is_empty() {
                    outcome.notices.push(RoomNotice::StateChanged {
                        room_id: self.room_id.clone(),
                        direction: Direction::Forward,
                        actor: actor.clone(),
                        changes: state_changes,
                        event: envelope.clone(),
                    });
                }

                let user_ids: BTreeSet<&String> = old_users
                    .keys()
                    .chain(new_users.keys())
                    .filter(|key| key.starts_with('@'))
                    .collect();
                for user_id in user_ids {
                    let old_level = old_users
                        .get(user_id)
                        .or_else(|| old_users.get("default"))
                        .copied();
                    // A user dropped from the new map falls back to the new
                    // default, then to the old one.
                    let new_level = new_users
                        .get(user_id)
                        .or_else(|| new_users.get("default"))
                        .or_else(|| old_users.get("default"))
                        .copied();
                    if old_level == new_level {
                        continue;
                    }
                    let subject = self
                        .forward
                        .member(user_id)
                        .map(Member::snapshot)
                        .unwrap_or_else(|| MemberSnapshot::bare(user_id.clone()));
                    let mut changes = Changes::new();
                    changes.insert(
                        "level".to_owned(),
                        change_pair(opt_i64_value(old_level), opt_i64_value(new_level)),
                    );
                    outcome.notices.push(RoomNotice::Membership {
                        room_id: self.room_id.clone(),
                        direction: Direction::Forward,
                        actor: actor.clone(),
                        subject,
                        changes,
                        event: envelope.clone(),
                    });
                }

                self.forward.level_by_userid = new_users;
                outcome
            }
        }
    }

    fn fold_action_levels(
        &mut self,
        phase: FoldPhase,
        envelope: &EventEnvelope,
        keys: &[(&str, &str)],
    ) -> FoldOutcome {
        match phase {
            FoldPhase::Backward => FoldOutcome::default(),
            FoldPhase::Initial => {
                for (wire_key, action) in keys {
                    if let Some(level) = envelope.content.get(wire_key).and_then(Value::as_i64) {
                        self.forward.levels.insert((*action).to_owned(), level);
                    }
                }
                FoldOutcome::default()
            }
            FoldPhase::Forward => {
                let actor = actor_from(&self.forward, envelope);
                let mut changes = Changes::new();
                for (wire_key, action) in keys {
                    let Some(level) = envelope.content.get(wire_key).and_then(Value::as_i64)
                    else {
                        continue;
                    };
                    let old = self.forward.levels.insert((*action).to_owned(), level);
                    if old != Some(level) {
                        changes.insert(
                            format!("level.{action}"),
                            change_pair(opt_i64_value(old), level.into()),
                        );
                    }
                }

                let mut outcome = FoldOutcome::default();
                if !changes.is_empty() {
                    outcome.notices.push(RoomNotice::StateChanged {
                        room_id: self.room_id.clone(),
                        direction: Direction::Forward,
                        actor,
                        changes,
                        event: envelope.clone(),
                    });
                }
                outcome
            }
        }
    }
}

fn scalar_slot<'a>(state: &'a mut RoomState, field: &str) -> &'a mut Option<String> {
    match field {
        "name" => &mut state.name,
        "topic" => &mut state.topic,
        _ => &mut state.join_rule,
    }
}

fn actor_from(projection: &RoomState, envelope: &EventEnvelope) -> Option<MemberSnapshot> {
    let actor_id = envelope.user_id.as_deref()?;
    Some(
        projection
            .member(actor_id)
            .map(Member::snapshot)
            .unwrap_or_else(|| MemberSnapshot::bare(actor_id)),
    )
}

fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    value.and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect()
    })
}

fn opt_str_value(value: Option<&str>) -> Value {
    value.map_or(Value::Null, Value::from)
}

fn opt_i64_value(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::from)
}

fn membership_value(membership: Option<Membership>) -> Value {
    membership.map_or(Value::Null, |m| m.as_str().into())
}

/// Split power-level content into the per-user map (including the
/// `default` sentinel) and the action-threshold map.
///
/// Accepts the flat layout, where `@user` keys and `default` sit beside
/// `*_level` action keys, as well as a nested `users` object. Unknown and
/// non-integer keys are ignored.
fn split_power_content(content: &Value) -> (BTreeMap<String, i64>, BTreeMap<String, i64>) {
    const ACTION_KEYS: [(&str, &str); 5] = [
        ("ban_level", "ban"),
        ("kick_level", "kick"),
        ("redact_level", "redact"),
        ("send_event_level", "send_event"),
        ("add_state_level", "add_state"),
    ];

    let mut users = BTreeMap::new();
    let mut actions = BTreeMap::new();
    let Some(object) = content.as_object() else {
        return (users, actions);
    };

    for (key, value) in object {
        if key == "users"
            && let Some(nested) = value.as_object()
        {
            for (user_id, level) in nested {
                if let Some(level) = level.as_i64() {
                    users.insert(user_id.clone(), level);
                }
            }
            continue;
        }

        let Some(level) = value.as_i64() else { continue };
        if key.starts_with('@') || key == "default" {
            users.insert(key.clone(), level);
        } else if let Some((_, action)) = ACTION_KEYS
            .iter()
            .find(|(wire, _)| *wire == key.as_str())
        {
            actions.insert((*action).to_owned(), level);
        }
    }
    (users, actions)
}

/// One side of a membership transition, normalised so that wire `"leave"`,
/// empty content, and a missing membership key all mean "absent".
#[derive(Debug, Clone, PartialEq, Eq)]
struct MemberSide {
    membership: Option<Membership>,
    displayname: Option<String>,
}

impl MemberSide {
    const ABSENT: Self = Self {
        membership: None,
        displayname: None,
    };
}

fn normalize_member_side(value: Option<&Value>) -> Result<MemberSide, ClientError> {
    let Some(content) = value else {
        return Ok(MemberSide::ABSENT);
    };
    let object = match content {
        Value::Null => return Ok(MemberSide::ABSENT),
        Value::Object(object) => object,
        other => {
            return Err(ClientError::protocol(format!(
                "member content of unexpected type: {other}"
            )));
        }
    };
    if object.is_empty() {
        return Ok(MemberSide::ABSENT);
    }

    let membership = match object.get("membership").and_then(Value::as_str) {
        None | Some("leave") => return Ok(MemberSide::ABSENT),
        Some("invite") => Membership::Invite,
        Some("join") => Membership::Join,
        Some(other) => {
            return Err(ClientError::protocol(format!(
                "unknown membership '{other}'"
            )));
        }
    };
    Ok(MemberSide {
        membership: Some(membership),
        displayname: object
            .get("displayname")
            .and_then(Value::as_str)
            .map(str::to_owned),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ROOM: &str = "!room:example.org";
    const SELF: &str = "@self:example.org";

    fn engine() -> RoomEngine {
        RoomEngine::new(ROOM, SELF)
    }

    fn envelope(value: Value) -> EventEnvelope {
        EventEnvelope::from_value(value).expect("test envelope should parse")
    }

    fn member_event(subject: &str, content: Value, prev: Option<Value>) -> EventEnvelope {
        let mut event = json!({
            "type": "m.room.member",
            "room_id": ROOM,
            "user_id": subject,
            "state_key": subject,
            "content": content,
        });
        if let Some(prev) = prev {
            event["prev_content"] = prev;
        }
        envelope(event)
    }

    fn fold(
        engine: &mut RoomEngine,
        users: &mut UserRegistry,
        kind: RoomEventKind,
        phase: FoldPhase,
        event: &EventEnvelope,
    ) -> FoldOutcome {
        engine.fold(kind, phase, users, event, &[])
    }

    #[test]
    fn initial_scalar_fold_sets_state_silently() {
        let mut engine = engine();
        let mut users = UserRegistry::default();
        let event = envelope(json!({
            "type": "m.room.name",
            "room_id": ROOM,
            "user_id": SELF,
            "content": {"name": "Lobby"},
        }));

        let outcome = fold(&mut engine, &mut users, RoomEventKind::Name, FoldPhase::Initial, &event);
        assert!(outcome.notices.is_empty());
        assert_eq!(engine.state().name.as_deref(), Some("Lobby"));
    }

    #[test]
    fn forward_scalar_fold_reports_old_and_new() {
        let mut engine = engine();
        let mut users = UserRegistry::default();
        let first = envelope(json!({
            "type": "m.room.topic",
            "room_id": ROOM,
            "user_id": SELF,
            "content": {"topic": "old topic"},
        }));
        fold(&mut engine, &mut users, RoomEventKind::Topic, FoldPhase::Forward, &first);

        let second = envelope(json!({
            "type": "m.room.topic",
            "room_id": ROOM,
            "user_id": SELF,
            "content": {"topic": "new topic"},
        }));
        let outcome = fold(&mut engine, &mut users, RoomEventKind::Topic, FoldPhase::Forward, &second);

        let RoomNotice::StateChanged { changes, direction, .. } = &outcome.notices[0] else {
            panic!("expected state change notice");
        };
        assert_eq!(*direction, Direction::Forward);
        assert_eq!(changes["topic"], vec![json!("old topic"), json!("new topic")]);
        assert_eq!(engine.state().topic.as_deref(), Some("new topic"));
    }

    #[test]
    fn backward_scalar_fold_reports_traversal_order_without_mutation() {
        let mut engine = engine();
        let mut users = UserRegistry::default();
        fold(
            &mut engine,
            &mut users,
            RoomEventKind::Name,
            FoldPhase::Initial,
            &envelope(json!({
                "type": "m.room.name",
                "room_id": ROOM,
                "user_id": SELF,
                "content": {"name": "Current"},
            })),
        );
        engine.begin_pagination().expect("pagination should begin");

        let event = envelope(json!({
            "type": "m.room.name",
            "room_id": ROOM,
            "user_id": SELF,
            "content": {"name": "Current"},
            "prev_content": {"name": "Older"},
        }));
        let outcome = fold(&mut engine, &mut users, RoomEventKind::Name, FoldPhase::Backward, &event);

        let RoomNotice::StateChanged { changes, direction, .. } = &outcome.notices[0] else {
            panic!("expected state change notice");
        };
        assert_eq!(*direction, Direction::Backward);
        assert_eq!(changes["name"], vec![json!("Current"), json!("Older")]);
        assert_eq!(engine.state().name.as_deref(), Some("Current"));
    }

    #[test]
    fn forward_alias_fold_reports_other_home_servers() {
        let mut engine = engine();
        let mut users = UserRegistry::default();
        fold(
            &mut engine,
            &mut users,
            RoomEventKind::Aliases,
            FoldPhase::Initial,
            &envelope(json!({
                "type": "m.room.aliases",
                "room_id": ROOM,
                "user_id": SELF,
                "state_key": "hs2",
                "content": {"aliases": ["#keep:hs2"]},
            })),
        );

        let outcome = fold(
            &mut engine,
            &mut users,
            RoomEventKind::Aliases,
            FoldPhase::Forward,
            &envelope(json!({
                "type": "m.room.aliases",
                "room_id": ROOM,
                "user_id": SELF,
                "state_key": "hs1",
                "content": {"aliases": ["#new:hs1"]},
            })),
        );

        let RoomNotice::StateChanged { changes, .. } = &outcome.notices[0] else {
            panic!("expected state change notice");
        };
        assert_eq!(
            changes["aliases"],
            vec![json!([]), json!(["#new:hs1"]), json!(["#keep:hs2"])]
        );
        let mut aliases = engine.state().aliases();
        aliases.sort();
        assert_eq!(aliases, vec!["#keep:hs2", "#new:hs1"]);
    }

    #[test]
    fn initial_member_fold_rejects_duplicates() {
        let mut engine = engine();
        let mut users = UserRegistry::default();
        let event = member_event("@a:hs", json!({"membership": "join"}), None);

        fold(&mut engine, &mut users, RoomEventKind::Member, FoldPhase::Initial, &event);
        let duplicate = member_event(
            "@a:hs",
            json!({"membership": "join", "displayname": "Other"}),
            None,
        );
        fold(&mut engine, &mut users, RoomEventKind::Member, FoldPhase::Initial, &duplicate);

        assert_eq!(engine.state().member_count(), 1);
        let member = engine.state().member("@a:hs").expect("member should exist");
        assert_eq!(member.displayname, None);
    }

    #[test]
    fn forward_member_join_creates_member_and_reports_changes() {
        let mut engine = engine();
        let mut users = UserRegistry::default();
        let event = member_event(
            "@a:hs",
            json!({"membership": "join", "displayname": "Alice"}),
            Some(json!({"membership": "invite"})),
        );

        let outcome = fold(&mut engine, &mut users, RoomEventKind::Member, FoldPhase::Forward, &event);
        let RoomNotice::Membership { changes, subject, .. } = &outcome.notices[0] else {
            panic!("expected membership notice");
        };
        assert_eq!(changes["membership"], vec![json!("invite"), json!("join")]);
        assert_eq!(changes["displayname"], vec![json!(null), json!("Alice")]);
        assert_eq!(subject.membership, Some(Membership::Join));
        assert!(!outcome.self_left);
        assert!(users.get("@a:hs").is_some());
        assert_eq!(engine.state().member_count(), 1);
    }

    #[test]
    fn forward_self_leave_removes_member_and_signals_deregistration() {
        let mut engine = engine();
        let mut users = UserRegistry::default();
        fold(
            &mut engine,
            &mut users,
            RoomEventKind::Member,
            FoldPhase::Initial,
            &member_event(SELF, json!({"membership": "join", "displayname": "U"}), None),
        );

        let leave = member_event(
            SELF,
            json!({"membership": "leave"}),
            Some(json!({"membership": "join", "displayname": "U"})),
        );
        let outcome = fold(&mut engine, &mut users, RoomEventKind::Member, FoldPhase::Forward, &leave);

        assert!(outcome.self_left);
        let RoomNotice::Membership { changes, .. } = &outcome.notices[0] else {
            panic!("expected membership notice");
        };
        assert_eq!(changes["membership"], vec![json!("join"), json!(null)]);
        assert_eq!(changes["displayname"], vec![json!("U"), json!(null)]);
        assert_eq!(engine.state().member_count(), 0);
    }

    #[test]
    fn backward_member_folds_rewind_to_the_initial_member_set() {
        let mut engine = engine();
        let mut users = UserRegistry::default();
        let join_a = member_event("@a:hs", json!({"membership": "join"}), None);
        let join_b = member_event("@b:hs", json!({"membership": "join"}), None);

        fold(&mut engine, &mut users, RoomEventKind::Member, FoldPhase::Forward, &join_a);
        fold(&mut engine, &mut users, RoomEventKind::Member, FoldPhase::Forward, &join_b);
        assert_eq!(engine.state().member_count(), 2);

        engine.begin_pagination().expect("pagination should begin");
        // Rewind in reverse order: B's join, then A's join.
        let out_b = fold(&mut engine, &mut users, RoomEventKind::Member, FoldPhase::Backward, &join_b);
        let RoomNotice::Membership { changes, direction, .. } = &out_b.notices[0] else {
            panic!("expected membership notice");
        };
        assert_eq!(*direction, Direction::Backward);
        assert_eq!(changes["membership"], vec![json!("join"), json!(null)]);

        fold(&mut engine, &mut users, RoomEventKind::Member, FoldPhase::Backward, &join_a);

        let back = engine.back_state().expect("backward projection should exist");
        assert_eq!(back.member_count(), 0);
        assert_eq!(engine.state().member_count(), 2);
    }

    #[test]
    fn power_level_fold_reports_exactly_one_changed_user() {
        let mut engine = engine();
        let mut users = UserRegistry::default();
        fold(
            &mut engine,
            &mut users,
            RoomEventKind::PowerLevels,
            FoldPhase::Initial,
            &envelope(json!({
                "type": "m.room.power_levels",
                "room_id": ROOM,
                "user_id": SELF,
                "content": {"default": 0, "@a:hs": 50},
            })),
        );
        assert_eq!(engine.state().member_level("@a:hs"), Some(50));
        assert_eq!(engine.state().member_level("@b:hs"), Some(0));

        let outcome = fold(
            &mut engine,
            &mut users,
            RoomEventKind::PowerLevels,
            FoldPhase::Forward,
            &envelope(json!({
                "type": "m.room.power_levels",
                "room_id": ROOM,
                "user_id": SELF,
                "content": {"@a:hs": 100, "default": 0},
                "prev_content": {"@a:hs": 50, "default": 0},
            })),
        );

        assert_eq!(outcome.notices.len(), 1);
        let RoomNotice::Membership { subject, changes, .. } = &outcome.notices[0] else {
            panic!("expected membership notice");
        };
        assert_eq!(subject.user_id, "@a:hs");
        assert_eq!(changes["level"], vec![json!(50), json!(100)]);
        assert_eq!(engine.state().member_level("@a:hs"), Some(100));
    }

    #[test]
    fn removed_power_level_user_falls_back_to_default() {
        let mut engine = engine();
        let mut users = UserRegistry::default();
        let outcome = fold(
            &mut engine,
            &mut users,
            RoomEventKind::PowerLevels,
            FoldPhase::Forward,
            &envelope(json!({
                "type": "m.room.power_levels",
                "room_id": ROOM,
                "user_id": SELF,
                "content": {"default": 0},
                "prev_content": {"@a:hs": 50, "default": 0},
            })),
        );

        assert_eq!(outcome.notices.len(), 1);
        let RoomNotice::Membership { subject, changes, .. } = &outcome.notices[0] else {
            panic!("expected membership notice");
        };
        assert_eq!(subject.user_id, "@a:hs");
        assert_eq!(changes["level"], vec![json!(50), json!(0)]);
    }

    #[test]
    fn power_level_fold_accepts_nested_users_map() {
        let mut engine = engine();
        let mut users = UserRegistry::default();
        let outcome = fold(
            &mut engine,
            &mut users,
            RoomEventKind::PowerLevels,
            FoldPhase::Forward,
            &envelope(json!({
                "type": "m.room.power_levels",
                "room_id": ROOM,
                "user_id": SELF,
                "content": {"users": {"@a:hs": 25, "default": 0}},
                "prev_content": {"default": 0},
            })),
        );

        assert_eq!(outcome.notices.len(), 1);
        let RoomNotice::Membership { subject, changes, .. } = &outcome.notices[0] else {
            panic!("expected membership notice");
        };
        assert_eq!(subject.user_id, "@a:hs");
        assert_eq!(changes["level"], vec![json!(0), json!(25)]);
        assert_eq!(engine.state().member_level("@a:hs"), Some(25));
        assert_eq!(engine.state().member_level("@b:hs"), Some(0));
    }

    #[test]
    fn legacy_ops_levels_fold_reports_action_thresholds() {
        let mut engine = engine();
        let mut users = UserRegistry::default();
        let outcome = fold(
            &mut engine,
            &mut users,
            RoomEventKind::OpsLevels,
            FoldPhase::Forward,
            &envelope(json!({
                "type": "m.room.ops_levels",
                "room_id": ROOM,
                "user_id": SELF,
                "content": {"ban_level": 50, "kick_level": 50, "redact_level": 25},
            })),
        );

        let RoomNotice::StateChanged { changes, .. } = &outcome.notices[0] else {
            panic!("expected state change notice");
        };
        assert_eq!(changes["level.ban"], vec![json!(null), json!(50)]);
        assert_eq!(changes["level.redact"], vec![json!(null), json!(25)]);
        assert_eq!(engine.state().action_level("kick"), Some(50));
    }

    #[test]
    fn unified_power_levels_carry_action_keys() {
        let mut engine = engine();
        let mut users = UserRegistry::default();
        let outcome = fold(
            &mut engine,
            &mut users,
            RoomEventKind::PowerLevels,
            FoldPhase::Forward,
            &envelope(json!({
                "type": "m.room.power_levels",
                "room_id": ROOM,
                "user_id": SELF,
                "content": {"default": 0, "send_event_level": 10},
                "prev_content": {"default": 0},
            })),
        );

        assert_eq!(outcome.notices.len(), 1);
        let RoomNotice::StateChanged { changes, .. } = &outcome.notices[0] else {
            panic!("expected state change notice");
        };
        assert_eq!(changes["level.send_event"], vec![json!(null), json!(10)]);
        assert_eq!(engine.state().action_level("send_event"), Some(10));
    }

    #[test]
    fn message_from_known_member_is_delivered() {
        let mut engine = engine();
        let mut users = UserRegistry::default();
        fold(
            &mut engine,
            &mut users,
            RoomEventKind::Member,
            FoldPhase::Initial,
            &member_event("@a:hs", json!({"membership": "join"}), None),
        );

        let message = envelope(json!({
            "type": "m.room.message",
            "room_id": ROOM,
            "user_id": "@a:hs",
            "content": {"msgtype": "m.text", "body": "hi"},
            "ts": 1000,
        }));
        let outcome = fold(&mut engine, &mut users, RoomEventKind::Message, FoldPhase::Forward, &message);

        let RoomNotice::Message { member, content, .. } = &outcome.notices[0] else {
            panic!("expected message notice");
        };
        assert_eq!(member.user_id, "@a:hs");
        assert_eq!(content["body"], json!("hi"));
    }

    #[test]
    fn message_from_unknown_member_is_dropped() {
        let mut engine = engine();
        let mut users = UserRegistry::default();
        let message = envelope(json!({
            "type": "m.room.message",
            "room_id": ROOM,
            "user_id": "@stranger:hs",
            "content": {"msgtype": "m.text", "body": "hi"},
        }));

        let outcome = fold(&mut engine, &mut users, RoomEventKind::Message, FoldPhase::Forward, &message);
        assert!(outcome.notices.is_empty());
    }

    #[test]
    fn pagination_clones_members_lazily_and_terminates_on_create() {
        let mut engine = engine();
        let mut users = UserRegistry::default();
        fold(
            &mut engine,
            &mut users,
            RoomEventKind::Member,
            FoldPhase::Initial,
            &member_event("@a:hs", json!({"membership": "join"}), None),
        );

        assert!(engine.back_state().is_none());
        let from = engine.begin_pagination().expect("first pagination should begin");
        assert_eq!(from, "END");
        let back = engine.back_state().expect("backward projection should exist");
        assert_eq!(back.member_count(), 1);

        fold(
            &mut engine,
            &mut users,
            RoomEventKind::Create,
            FoldPhase::Backward,
            &envelope(json!({
                "type": "m.room.create",
                "room_id": ROOM,
                "user_id": SELF,
                "content": {"creator": SELF},
            })),
        );
        engine.finish_pagination("t-prev");

        assert_eq!(*engine.pagination_token(), PaginationToken::Start);
        let err = engine
            .begin_pagination()
            .expect_err("exhausted pagination should fail");
        assert_eq!(err, ClientError::PaginationExhausted);
    }

    #[test]
    fn pagination_token_advances_between_pages() {
        let mut engine = engine();
        engine.begin_pagination().expect("pagination should begin");
        engine.finish_pagination("t-10");
        assert_eq!(
            engine.begin_pagination().expect("second page should begin"),
            "t-10"
        );
    }

    #[test]
    fn marks_synced_exactly_once() {
        let mut engine = engine();
        assert!(engine.mark_synced());
        assert!(!engine.mark_synced());
        assert!(engine.is_synced());
    }
}
