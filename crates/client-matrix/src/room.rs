use std::sync::{Arc, PoisonError, RwLock};

use client_core::{
    ClientError, Dispatcher, EventEnvelope, FoldPhase, Handler, MemberSnapshot, Notice, NoticeHub,
    PaginationToken, RoomEngine, RoomEventKind, RoomNotice, UserRegistry,
};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::transport::{Transport, encode_segment};

/// Built-in message kinds for the typed send helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Notice,
    Emote,
}

impl MessageType {
    fn msgtype(self) -> &'static str {
        match self {
            Self::Text => "m.text",
            Self::Notice => "m.notice",
            Self::Emote => "m.emote",
        }
    }
}

/// Handle to one room: the folding engine plus its wire operations.
///
/// Cloning is cheap; all clones observe the same state.
#[derive(Clone)]
pub struct Room {
    inner: Arc<RoomInner>,
}

struct RoomInner {
    room_id: String,
    engine: RwLock<RoomEngine>,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    hub: NoticeHub,
    users: Arc<RwLock<UserRegistry>>,
    pagination_limit_cap: u16,
}

impl Room {
    pub(crate) fn new(
        room_id: impl Into<String>,
        local_user_id: &str,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<Dispatcher>,
        hub: NoticeHub,
        users: Arc<RwLock<UserRegistry>>,
        pagination_limit_cap: u16,
    ) -> Self {
        let room_id = room_id.into();
        Self {
            inner: Arc::new(RoomInner {
                engine: RwLock::new(RoomEngine::new(room_id.clone(), local_user_id)),
                room_id,
                transport,
                dispatcher,
                hub,
                users,
                pagination_limit_cap,
            }),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.inner.room_id
    }

    pub fn name(&self) -> Option<String> {
        self.read_engine(|engine| engine.state().name.clone())
    }

    pub fn topic(&self) -> Option<String> {
        self.read_engine(|engine| engine.state().topic.clone())
    }

    pub fn join_rule(&self) -> Option<String> {
        self.read_engine(|engine| engine.state().join_rule.clone())
    }

    /// All aliases across home servers, concatenated.
    pub fn aliases(&self) -> Vec<String> {
        self.read_engine(|engine| engine.state().aliases())
    }

    pub fn members(&self) -> Vec<MemberSnapshot> {
        self.read_engine(|engine| engine.state().members())
    }

    pub fn member_snapshot(&self, user_id: &str) -> Option<MemberSnapshot> {
        self.read_engine(|engine| engine.state().member_snapshot(user_id))
    }

    /// Effective power level: user-specific entry, else the default one.
    pub fn member_level(&self, user_id: &str) -> Option<i64> {
        self.read_engine(|engine| engine.state().member_level(user_id))
    }

    pub fn pagination_token(&self) -> PaginationToken {
        self.read_engine(|engine| engine.pagination_token().clone())
    }

    /// Send a raw `m.room.message` content object.
    pub async fn send_message(&self, content: Value) -> Result<Option<String>, ClientError> {
        let path = format!(
            "/rooms/{}/send/m.room.message",
            encode_segment(&self.inner.room_id)
        );
        let response = self.inner.transport.post_json(&path, &content).await?;
        Ok(response
            .as_ref()
            .and_then(|value| value.get("event_id"))
            .and_then(Value::as_str)
            .map(str::to_owned))
    }

    pub async fn send_text(&self, body: &str) -> Result<Option<String>, ClientError> {
        self.send_typed(MessageType::Text, body).await
    }

    pub async fn send_notice(&self, body: &str) -> Result<Option<String>, ClientError> {
        self.send_typed(MessageType::Notice, body).await
    }

    pub async fn send_emote(&self, body: &str) -> Result<Option<String>, ClientError> {
        self.send_typed(MessageType::Emote, body).await
    }

    async fn send_typed(
        &self,
        msgtype: MessageType,
        body: &str,
    ) -> Result<Option<String>, ClientError> {
        self.send_message(json!({"msgtype": msgtype.msgtype(), "body": body}))
            .await
    }

    /// Invite a user into the room.
    pub async fn invite(&self, user_id: &str) -> Result<(), ClientError> {
        let path = format!("/rooms/{}/invite", encode_segment(&self.inner.room_id));
        self.inner
            .transport
            .post_json(&path, &json!({"user_id": user_id}))
            .await
            .map(|_| ())
    }

    /// Leave the room. Deregistration happens when the resulting membership
    /// event streams back.
    pub async fn leave(&self) -> Result<(), ClientError> {
        let path = format!("/rooms/{}/leave", encode_segment(&self.inner.room_id));
        self.inner
            .transport
            .post_json(&path, &json!({}))
            .await
            .map(|_| ())
    }

    /// Replace a state slot.
    pub async fn set_state(
        &self,
        event_type: &str,
        state_key: Option<&str>,
        content: Value,
    ) -> Result<(), ClientError> {
        let mut path = format!(
            "/rooms/{}/state/{}",
            encode_segment(&self.inner.room_id),
            encode_segment(event_type)
        );
        if let Some(key) = state_key {
            path.push('/');
            path.push_str(&encode_segment(key));
        }
        self.inner
            .transport
            .put_json(&path, &content)
            .await
            .map(|_| ())
    }

    pub async fn set_name(&self, name: &str) -> Result<(), ClientError> {
        self.set_state("m.room.name", None, json!({"name": name}))
            .await
    }

    pub async fn set_topic(&self, topic: &str) -> Result<(), ClientError> {
        self.set_state("m.room.topic", None, json!({"topic": topic}))
            .await
    }

    /// Publish a power-levels event with one user's level changed, keeping
    /// every other entry and the action thresholds as currently known.
    pub async fn set_user_level(&self, user_id: &str, level: i64) -> Result<(), ClientError> {
        let content = self.read_engine(|engine| {
            let state = engine.state();
            let mut object = serde_json::Map::new();
            for (uid, lv) in state.levels_by_userid() {
                object.insert(uid.clone(), (*lv).into());
            }
            object.insert(user_id.to_owned(), level.into());
            for (action, lv) in state.action_levels() {
                object.insert(format!("{action}_level"), (*lv).into());
            }
            Value::Object(object)
        });
        self.set_state("m.room.power_levels", None, content).await
    }

    /// Fetch one page of older history and fold it through the backward
    /// projection. Returns the number of events folded.
    pub async fn paginate_messages(&self, limit: u16) -> Result<usize, ClientError> {
        let limit = bounded_paginate_limit(limit, self.inner.pagination_limit_cap);
        let from = self.write_engine(|engine| engine.begin_pagination())?;

        let path = format!("/rooms/{}/messages", encode_segment(&self.inner.room_id));
        let query = [
            ("from".to_owned(), from),
            ("dir".to_owned(), "b".to_owned()),
            ("limit".to_owned(), limit.to_string()),
        ];
        let response = self
            .inner
            .transport
            .get_json(&path, &query)
            .await?
            .ok_or_else(|| ClientError::protocol("empty messages response"))?;
        let chunk = response
            .get("chunk")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| ClientError::protocol("messages response missing 'chunk'"))?;
        let end = response
            .get("end")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| ClientError::protocol("messages response missing 'end'"))?;

        let mut folded = 0;
        let mut notices = Vec::new();
        {
            let mut engine = self
                .inner
                .engine
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let mut users = self
                .inner
                .users
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for raw in chunk {
                let envelope = match EventEnvelope::from_value(raw) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(room = %self.inner.room_id, error = %err, "history event dropped");
                        continue;
                    }
                };
                match self.inner.dispatcher.resolve(&envelope.event_type) {
                    Some((Handler::Room(kind), suffix)) => {
                        let outcome =
                            engine.fold(kind, FoldPhase::Backward, &mut users, &envelope, &suffix);
                        notices.extend(outcome.notices);
                        folded += 1;
                    }
                    Some((Handler::Presence, _)) | None => {
                        debug!(
                            room = %self.inner.room_id,
                            event_type = %envelope.event_type,
                            "non-room event in history chunk skipped"
                        );
                    }
                }
            }
            engine.finish_pagination(end);
        }

        for notice in notices {
            self.inner.hub.emit(Notice::Room(notice));
        }
        Ok(folded)
    }

    /// Fold one streamed or snapshot event. Returns whether the local user
    /// left the room, in which case the caller deregisters it.
    pub(crate) fn apply_event(
        &self,
        phase: FoldPhase,
        kind: RoomEventKind,
        suffix: &[&str],
        envelope: &EventEnvelope,
    ) -> bool {
        let outcome = {
            let mut engine = self
                .inner
                .engine
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let mut users = self
                .inner
                .users
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            engine.fold(kind, phase, &mut users, envelope, suffix)
        };

        let self_left = outcome.self_left;
        for notice in outcome.notices {
            self.inner.hub.emit(Notice::Room(notice));
        }
        self_left
    }

    /// Emit `SyncedState` the first time the room's snapshot finishes.
    pub(crate) fn mark_synced_and_notify(&self) {
        let newly_synced = self.write_engine(|engine| engine.mark_synced());
        if newly_synced {
            self.inner.hub.emit(Notice::Room(RoomNotice::SyncedState {
                room_id: self.inner.room_id.clone(),
            }));
        }
    }

    pub(crate) fn emit_presence(&self, member: MemberSnapshot, changes: client_core::Changes) {
        self.inner.hub.emit(Notice::Room(RoomNotice::Presence {
            room_id: self.inner.room_id.clone(),
            member,
            changes,
        }));
    }

    fn read_engine<T>(&self, read: impl FnOnce(&RoomEngine) -> T) -> T {
        let engine = self
            .inner
            .engine
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        read(&engine)
    }

    fn write_engine<T>(&self, write: impl FnOnce(&mut RoomEngine) -> T) -> T {
        let mut engine = self
            .inner
            .engine
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        write(&mut engine)
    }
}

/// Clamp a requested pagination limit against the configured cap.
///
/// The result is always in `1..=100`.
fn bounded_paginate_limit(requested: u16, cap: u16) -> u16 {
    requested.max(1).min(cap.max(1)).min(100)
}
