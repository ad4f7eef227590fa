use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use client_core::{
    ClientError, ClientNotice, ClientPhase, Dispatcher, EventEnvelope, FoldPhase, Handler,
    LifecycleMachine, Notice, NoticeHub, NoticeStream, PollBackoff, Presence, RoomEventKind,
    RoomTarget, UserRegistry, UserSnapshot, fold_presence, select_room_target, snapshot_user,
};
use serde_json::{Value, json};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    auth::{Credentials, select_login_flow, select_register_stages},
    config::ClientConfig,
    pump::{Pump, PumpTask, SyncHandle, SyncState},
    room::Room,
    transport::{HttpTransport, Transport, encode_segment},
};

#[derive(Debug, Clone)]
struct Session {
    user_id: String,
    access_token: String,
}

/// Matrix v1 client: session, registries, the event pump, and the
/// high-level room and profile operations.
///
/// Cloning is cheap; all clones share one session and one pump.
#[derive(Clone)]
pub struct MatrixClient {
    inner: Arc<ClientShared>,
}

struct ClientShared {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    hub: NoticeHub,
    lifecycle: RwLock<LifecycleMachine>,
    session: RwLock<Option<Session>>,
    users: Arc<RwLock<UserRegistry>>,
    rooms: RwLock<HashMap<String, Room>>,
    pump: Mutex<Option<PumpTask>>,
}

impl MatrixClient {
    /// Client speaking HTTPS to the configured home server.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let transport = HttpTransport::new(&config.server, &config.path_prefix)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Client over a caller-supplied transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(ClientShared {
                config,
                transport,
                dispatcher: Arc::new(Dispatcher::with_default_handlers()),
                hub: NoticeHub::default(),
                lifecycle: RwLock::new(LifecycleMachine::default()),
                session: RwLock::new(None),
                users: Arc::new(RwLock::new(UserRegistry::default())),
                rooms: RwLock::new(HashMap::new()),
                pump: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to every notice emitted from now on.
    pub fn subscribe(&self) -> NoticeStream {
        self.inner.hub.subscribe()
    }

    pub fn phase(&self) -> ClientPhase {
        self.inner
            .lifecycle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .phase()
    }

    /// The authenticated user, once login has completed.
    pub fn user_id(&self) -> Option<String> {
        self.inner
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|session| session.user_id.clone())
    }

    pub fn room(&self, room_id: &str) -> Option<Room> {
        self.inner
            .rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(room_id)
            .cloned()
    }

    pub fn rooms(&self) -> Vec<Room> {
        self.inner
            .rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn user(&self, user_id: &str) -> Option<UserSnapshot> {
        self.inner
            .users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .map(|user| snapshot_user(&user))
    }

    /// Discover the server's login flows, run the first satisfiable one,
    /// then start streaming. Completes once the initial sync has been
    /// fully folded.
    pub async fn login(&self, credentials: Credentials) -> Result<SyncHandle, ClientError> {
        self.transition(LifecycleMachine::begin_login)?;
        match self.login_inner(credentials).await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                let _ = self.transition(LifecycleMachine::auth_failed);
                Err(err)
            }
        }
    }

    /// Short-circuit login with an already-issued access token.
    pub async fn login_with_token(
        &self,
        user_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Result<SyncHandle, ClientError> {
        self.transition(LifecycleMachine::begin_login)?;
        self.install_session(Session {
            user_id: user_id.into(),
            access_token: access_token.into(),
        });
        match self.finish_login().await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                let _ = self.transition(LifecycleMachine::auth_failed);
                Err(err)
            }
        }
    }

    /// Discover the register flows and run every stage of the first
    /// satisfiable one, threading the server's `session` token through.
    pub async fn register(&self, credentials: Credentials) -> Result<SyncHandle, ClientError> {
        self.transition(LifecycleMachine::begin_login)?;
        match self.register_inner(credentials).await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                let _ = self.transition(LifecycleMachine::auth_failed);
                Err(err)
            }
        }
    }

    async fn login_inner(&self, credentials: Credentials) -> Result<SyncHandle, ClientError> {
        let flows = require_json(
            self.inner.transport.get_json("/login", &[]).await?,
            "login discovery",
        )?;
        let stage = select_login_flow(&flows, &credentials)?;

        let body = stage.request_body(&credentials, None);
        let response = self
            .inner
            .transport
            .post_json("/login", &body)
            .await
            .map_err(reject_auth)?;
        let response = require_json(response, "login")?;
        self.install_session(session_from(&response)?);
        self.finish_login().await
    }

    async fn register_inner(&self, credentials: Credentials) -> Result<SyncHandle, ClientError> {
        let flows = require_json(
            self.inner.transport.get_json("/register", &[]).await?,
            "register discovery",
        )?;
        let stages = select_register_stages(&flows, &credentials)?;

        let mut session_token: Option<String> = None;
        let mut session: Option<Session> = None;
        for stage in stages {
            let body = stage.request_body(&credentials, session_token.as_deref());
            let response = self
                .inner
                .transport
                .post_json("/register", &body)
                .await
                .map_err(reject_auth)?;
            let response = require_json(response, "register")?;

            if let Ok(done) = session_from(&response) {
                session = Some(done);
                break;
            }
            session_token = response
                .get("session")
                .and_then(Value::as_str)
                .map(str::to_owned);
        }

        let session = session.ok_or_else(|| {
            ClientError::AuthRejected("register flow ended without credentials".to_owned())
        })?;
        self.install_session(session);
        self.finish_login().await
    }

    async fn finish_login(&self) -> Result<SyncHandle, ClientError> {
        let handle = self.start().await?;
        handle.clone().synced().await?;
        Ok(handle)
    }

    /// Idempotently start the event pump.
    ///
    /// The first call issues `initialSync` and begins streaming; later
    /// calls return the same handle while the pump is alive. A failed
    /// initial sync clears the pump so the next call retries.
    pub async fn start(&self) -> Result<SyncHandle, ClientError> {
        let mut pump_slot = self.inner.pump.lock().await;
        if let Some(task) = pump_slot.as_ref() {
            return Ok(SyncHandle::new(task.synced.clone()));
        }

        self.transition(LifecycleMachine::begin_sync)?;
        let (synced_tx, synced_rx) = watch::channel(SyncState::Pending);
        let cancel = CancellationToken::new();
        let pump = Pump {
            client: self.clone(),
            cancel: cancel.child_token(),
            synced_tx,
            backoff: PollBackoff::new(
                self.inner.config.backoff_base_ms,
                self.inner.config.backoff_max_ms,
            ),
            event_timeout_ms: self.inner.config.event_timeout_ms,
            poll_margin_ms: self.inner.config.poll_margin_ms,
        };
        let task = tokio::spawn(pump.run());
        *pump_slot = Some(PumpTask {
            cancel,
            task,
            synced: synced_rx.clone(),
        });
        Ok(SyncHandle::new(synced_rx))
    }

    /// Cancel the pump and any in-flight poll. Safe to call repeatedly and
    /// regardless of start state.
    pub async fn stop(&self) {
        let task = self.inner.pump.lock().await.take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(err) = task.task.await {
                debug!(error = %err, "pump task ended abnormally");
            }
        }
        let _ = self.transition(LifecycleMachine::stop);
    }

    /// `POST /createRoom`, register the room, and complete its initial
    /// state sync. Returns the room and the server-assigned full alias.
    pub async fn create_room(
        &self,
        alias_localpart: Option<&str>,
    ) -> Result<(Room, Option<String>), ClientError> {
        let mut body = json!({});
        if let Some(alias) = alias_localpart {
            body["room_alias_name"] = alias.into();
        }
        let response = require_json(
            self.inner.transport.post_json("/createRoom", &body).await?,
            "createRoom",
        )?;
        let room_id = response
            .get("room_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::protocol("createRoom response missing 'room_id'"))?;
        let alias = response
            .get("room_alias")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let room = self.ensure_room(room_id)?;
        self.sync_room_state(&room).await?;
        Ok((room, alias))
    }

    /// Join a room by `#alias` or `!id`. A room already in the registry is
    /// returned without re-syncing.
    pub async fn join_room(&self, alias_or_id: &str) -> Result<Room, ClientError> {
        if alias_or_id.starts_with('!')
            && let Some(room) = self.room(alias_or_id)
        {
            return Ok(room);
        }

        let room_id = if alias_or_id.starts_with('#') {
            let path = format!("/join/{}", encode_segment(alias_or_id));
            let response = require_json(
                self.inner.transport.post_json(&path, &json!({})).await?,
                "join",
            )?;
            response
                .get("room_id")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| ClientError::protocol("join response missing 'room_id'"))?
        } else if alias_or_id.starts_with('!') {
            let user_id = self
                .user_id()
                .ok_or_else(|| ClientError::invalid_phase(self.phase(), "join"))?;
            let path = format!(
                "/rooms/{}/state/m.room.member/{}",
                encode_segment(alias_or_id),
                encode_segment(&user_id)
            );
            self.inner
                .transport
                .put_json(&path, &json!({"membership": "join"}))
                .await?;
            alias_or_id.to_owned()
        } else {
            return Err(ClientError::protocol(format!(
                "expected a #alias or !room id, got '{alias_or_id}'"
            )));
        };

        if let Some(room) = self.room(&room_id) {
            return Ok(room);
        }
        let room = self.ensure_room(&room_id)?;
        self.sync_room_state(&room).await?;
        Ok(room)
    }

    /// Bind a directory alias to a room.
    pub async fn add_alias(&self, alias: &str, room_id: &str) -> Result<(), ClientError> {
        let path = format!("/directory/room/{}", encode_segment(alias));
        self.inner
            .transport
            .put_json(&path, &json!({"room_id": room_id}))
            .await
            .map(|_| ())
    }

    pub async fn delete_alias(&self, alias: &str) -> Result<(), ClientError> {
        let path = format!("/directory/room/{}", encode_segment(alias));
        self.inner.transport.delete_json(&path).await.map(|_| ())
    }

    pub async fn displayname(&self, user_id: &str) -> Result<Option<String>, ClientError> {
        let path = format!("/profile/{}/displayname", encode_segment(user_id));
        let response = self.inner.transport.get_json(&path, &[]).await?;
        Ok(response
            .as_ref()
            .and_then(|value| value.get("displayname"))
            .and_then(Value::as_str)
            .map(str::to_owned))
    }

    pub async fn set_displayname(&self, displayname: &str) -> Result<(), ClientError> {
        let user_id = self
            .user_id()
            .ok_or_else(|| ClientError::invalid_phase(self.phase(), "set_displayname"))?;
        let path = format!("/profile/{}/displayname", encode_segment(&user_id));
        self.inner
            .transport
            .put_json(&path, &json!({"displayname": displayname}))
            .await
            .map(|_| ())
    }

    pub async fn presence_status(&self, user_id: &str) -> Result<Option<Value>, ClientError> {
        let path = format!("/presence/{}/status", encode_segment(user_id));
        self.inner.transport.get_json(&path, &[]).await
    }

    pub async fn set_presence(&self, presence: Presence) -> Result<(), ClientError> {
        let user_id = self
            .user_id()
            .ok_or_else(|| ClientError::invalid_phase(self.phase(), "set_presence"))?;
        let path = format!("/presence/{}/status", encode_segment(&user_id));
        self.inner
            .transport
            .put_json(&path, &json!({"presence": presence}))
            .await
            .map(|_| ())
    }

    pub async fn presence_list(&self) -> Result<Option<Value>, ClientError> {
        let user_id = self
            .user_id()
            .ok_or_else(|| ClientError::invalid_phase(self.phase(), "presence_list"))?;
        let path = format!("/presence_list/{}", encode_segment(&user_id));
        self.inner.transport.get_json(&path, &[]).await
    }

    pub async fn invite_presence(&self, user_id: &str) -> Result<(), ClientError> {
        self.presence_list_op(json!({"invite": [user_id]})).await
    }

    pub async fn drop_presence(&self, user_id: &str) -> Result<(), ClientError> {
        self.presence_list_op(json!({"drop": [user_id]})).await
    }

    async fn presence_list_op(&self, body: Value) -> Result<(), ClientError> {
        let user_id = self
            .user_id()
            .ok_or_else(|| ClientError::invalid_phase(self.phase(), "presence_list"))?;
        let path = format!("/presence_list/{}", encode_segment(&user_id));
        self.inner
            .transport
            .post_json(&path, &body)
            .await
            .map(|_| ())
    }

    /// One-shot `initialSync?limit=0`: fold presence and joined rooms,
    /// return the stream token the pump continues from.
    pub(crate) async fn run_initial_sync(&self) -> Result<String, ClientError> {
        let response = self
            .inner
            .transport
            .get_json("/initialSync", &[("limit".to_owned(), "0".to_owned())])
            .await?
            .ok_or_else(|| ClientError::protocol("empty initialSync response"))?;
        let end = response
            .get("end")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| ClientError::protocol("initialSync response missing 'end'"))?;

        for raw in response
            .get("presence")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
        {
            match EventEnvelope::from_value(raw) {
                Ok(envelope) => self.apply_event(&envelope),
                Err(err) => warn!(error = %err, "snapshot presence event dropped"),
            }
        }

        for room in response
            .get("rooms")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
        {
            self.apply_initial_room(&room);
        }
        Ok(end)
    }

    fn apply_initial_room(&self, room: &Value) {
        let Some(room_id) = room.get("room_id").and_then(Value::as_str) else {
            warn!("snapshot room without room_id ignored");
            return;
        };

        match room.get("membership").and_then(Value::as_str) {
            Some("join") => {
                let handle = match self.ensure_room(room_id) {
                    Ok(handle) => handle,
                    Err(err) => {
                        warn!(room = %room_id, error = %err, "snapshot room dropped");
                        return;
                    }
                };
                for raw in room
                    .get("state")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default()
                {
                    match EventEnvelope::from_value(raw) {
                        Ok(envelope) => self.apply_room_initial(&handle, &envelope),
                        Err(err) => {
                            warn!(room = %room_id, error = %err, "snapshot state event dropped");
                        }
                    }
                }
                handle.mark_synced_and_notify();
            }
            Some("invite") => {
                let event = EventEnvelope {
                    event_type: "m.room.member".to_owned(),
                    content: json!({"membership": "invite"}),
                    prev_content: None,
                    user_id: None,
                    state_key: self.user_id(),
                    room_id: Some(room_id.to_owned()),
                    event_id: None,
                    ts: None,
                };
                self.inner
                    .hub
                    .emit(Notice::Client(ClientNotice::Invite { event }));
            }
            other => {
                debug!(room = %room_id, membership = ?other, "snapshot room with unhandled membership ignored");
            }
        }
    }

    fn apply_room_initial(&self, room: &Room, envelope: &EventEnvelope) {
        match self.inner.dispatcher.resolve(&envelope.event_type) {
            Some((Handler::Room(kind), suffix)) => {
                room.apply_event(FoldPhase::Initial, kind, &suffix, envelope);
            }
            Some((Handler::Presence, _)) => self.apply_presence(envelope),
            None => {
                debug!(event_type = %envelope.event_type, "snapshot event without handler");
                self.inner.hub.emit(Notice::Client(ClientNotice::UnknownEvent {
                    event: envelope.clone(),
                }));
            }
        }
    }

    /// Route one streamed event to its handler. Synchronous relative to
    /// the pump: events in one poll response fold in array order.
    pub(crate) fn apply_event(&self, envelope: &EventEnvelope) {
        match self.inner.dispatcher.resolve(&envelope.event_type) {
            Some((Handler::Presence, _)) => self.apply_presence(envelope),
            Some((Handler::Room(kind), suffix)) => {
                self.apply_room_event(kind, &suffix, envelope);
            }
            None => {
                debug!(event_type = %envelope.event_type, "event without handler");
                self.inner.hub.emit(Notice::Client(ClientNotice::UnknownEvent {
                    event: envelope.clone(),
                }));
            }
        }
    }

    fn apply_room_event(&self, kind: RoomEventKind, suffix: &[&str], envelope: &EventEnvelope) {
        let local_user = self.user_id().unwrap_or_default();
        let room = envelope
            .room_id
            .as_deref()
            .and_then(|room_id| self.room(room_id));

        match select_room_target(room.is_some(), envelope.state_key.as_deref(), &local_user) {
            RoomTarget::KnownRoom => {
                let Some(room) = room else { return };
                let self_left = room.apply_event(FoldPhase::Forward, kind, suffix, envelope);
                if self_left {
                    self.deregister_room(room.room_id());
                }
            }
            RoomTarget::SelfScoped => {
                if kind == RoomEventKind::Member
                    && envelope.content_str("membership") == Some("invite")
                {
                    self.inner.hub.emit(Notice::Client(ClientNotice::Invite {
                        event: envelope.clone(),
                    }));
                } else {
                    warn!(
                        event_type = %envelope.event_type,
                        "self-targeted state for unknown room dropped"
                    );
                }
            }
            RoomTarget::Drop => {
                warn!(
                    event_type = %envelope.event_type,
                    room = ?envelope.room_id,
                    "event for unknown room dropped"
                );
            }
        }
    }

    fn apply_presence(&self, envelope: &EventEnvelope) {
        let folded = {
            let mut users = self
                .inner
                .users
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            fold_presence(&mut users, envelope)
        };

        match folded {
            Ok((user, changes)) => {
                self.inner.hub.emit(Notice::Client(ClientNotice::Presence {
                    user: user.clone(),
                    changes: changes.clone(),
                }));
                for room in self.rooms() {
                    if let Some(member) = room.member_snapshot(&user.user_id) {
                        room.emit_presence(member, changes.clone());
                    }
                }
            }
            Err(err) => warn!(error = %err, "presence event dropped"),
        }
    }

    /// Fetch `/rooms/{id}/state` and fold it as the room's initial state.
    async fn sync_room_state(&self, room: &Room) -> Result<(), ClientError> {
        let path = format!("/rooms/{}/state", encode_segment(room.room_id()));
        let response = self
            .inner
            .transport
            .get_json(&path, &[])
            .await?
            .ok_or_else(|| ClientError::protocol("empty room state response"))?;
        let events = response
            .as_array()
            .cloned()
            .ok_or_else(|| ClientError::protocol("room state response is not a list"))?;

        for raw in events {
            match EventEnvelope::from_value(raw) {
                Ok(envelope) => self.apply_room_initial(room, &envelope),
                Err(err) => {
                    warn!(room = %room.room_id(), error = %err, "room state event dropped");
                }
            }
        }
        room.mark_synced_and_notify();
        Ok(())
    }

    /// Look up or create the room handle, announcing new registrations.
    fn ensure_room(&self, room_id: &str) -> Result<Room, ClientError> {
        let local_user = self
            .user_id()
            .ok_or_else(|| ClientError::invalid_phase(self.phase(), "room registration"))?;

        let mut created = false;
        let room = {
            let mut rooms = self
                .inner
                .rooms
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            rooms
                .entry(room_id.to_owned())
                .or_insert_with(|| {
                    created = true;
                    Room::new(
                        room_id,
                        &local_user,
                        self.inner.transport.clone(),
                        self.inner.dispatcher.clone(),
                        self.inner.hub.clone(),
                        self.inner.users.clone(),
                        self.inner.config.pagination_limit_cap,
                    )
                })
                .clone()
        };

        if created {
            self.inner.hub.emit(Notice::Client(ClientNotice::RoomNew {
                room_id: room_id.to_owned(),
            }));
        }
        Ok(room)
    }

    /// Drop a room after the local user left it. The room-level membership
    /// notice has already been emitted by the fold.
    fn deregister_room(&self, room_id: &str) {
        let removed = self
            .inner
            .rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(room_id);
        if removed.is_some() {
            self.inner.hub.emit(Notice::Client(ClientNotice::RoomDel {
                room_id: room_id.to_owned(),
            }));
        }
    }

    fn install_session(&self, session: Session) {
        self.inner.transport.set_access_token(&session.access_token);
        *self
            .inner
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(session);
    }

    fn transition<F>(&self, apply: F) -> Result<ClientPhase, ClientError>
    where
        F: FnOnce(&mut LifecycleMachine) -> Result<ClientPhase, ClientError>,
    {
        let result = {
            let mut lifecycle = self
                .inner
                .lifecycle
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            apply(&mut lifecycle)
        };
        if let Ok(phase) = &result {
            self.inner
                .hub
                .emit(Notice::Client(ClientNotice::Lifecycle { phase: *phase }));
        }
        result
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        self.inner.transport.clone()
    }

    pub(crate) fn note_sync_ready(&self) {
        let _ = self.transition(LifecycleMachine::sync_ready);
    }

    pub(crate) fn note_sync_failed(&self) {
        let _ = self.transition(LifecycleMachine::sync_failed);
    }

    pub(crate) fn note_poll_failed(&self) {
        let _ = self.transition(LifecycleMachine::poll_failed);
    }

    pub(crate) fn note_poll_recovered(&self) {
        let _ = self.transition(LifecycleMachine::poll_recovered);
    }

    pub(crate) fn emit_error(&self, error: ClientError, context: &str) {
        self.inner.hub.emit(Notice::Client(ClientNotice::Error {
            error,
            context: context.to_owned(),
        }));
    }

    pub(crate) async fn clear_pump(&self) {
        self.inner.pump.lock().await.take();
    }
}

fn require_json(response: Option<Value>, what: &str) -> Result<Value, ClientError> {
    response.ok_or_else(|| ClientError::protocol(format!("empty {what} response")))
}

fn session_from(response: &Value) -> Result<Session, ClientError> {
    let access_token = response
        .get("access_token")
        .and_then(Value::as_str)
        .ok_or_else(|| ClientError::protocol("auth response missing 'access_token'"))?;
    let user_id = response
        .get("user_id")
        .and_then(Value::as_str)
        .ok_or_else(|| ClientError::protocol("auth response missing 'user_id'"))?;
    Ok(Session {
        user_id: user_id.to_owned(),
        access_token: access_token.to_owned(),
    })
}

/// Client-side 4xx on an auth endpoint means the server refused us.
fn reject_auth(err: ClientError) -> ClientError {
    match err {
        ClientError::Status { status, message } if (400..500).contains(&status) => {
            ClientError::AuthRejected(message)
        }
        other => other,
    }
}
