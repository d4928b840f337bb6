//! In-memory collaborators for unit and router tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{Router, body::Body, http::Request, middleware, response::Response};
use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use shared::{
    config::server::{Config, HubConfig, Profile},
    models::{AudienceClass, AudienceKey, ChatMessage, GroupType, NormalizedEvent, ReadReceipt},
};

use crate::{
    app_state::{AppState, Dependencies},
    bridge::{DeliveryError, DeliverySink, HubError, Invocation, UpstreamLink, UpstreamTransport},
    cache::{CacheBackend, CacheError, ReadStateCache, memory::MemoryBackend},
    middleware::request_context::{RequestIdState, assign_request_id},
    store::{
        ChatScope, MembershipDirectory, MessageStore, ReceiptStore, StoreError, StoreResult,
        postgres::classes_for_role,
    },
};

pub(crate) fn message(id: i64, target_id: i64, group_type: GroupType, sender_id: i64) -> ChatMessage {
    ChatMessage {
        id,
        target_id,
        group_type,
        sender_id,
        content_type: "text".into(),
        content: format!("message {id}"),
        sent_at: Utc.timestamp_opt(1_700_000_000 + id, 0).single().unwrap(),
        hidden: false,
        pinned: false,
        edited: false,
    }
}

pub(crate) fn memory_backend() -> Arc<dyn CacheBackend> {
    Arc::new(MemoryBackend::new())
}

pub(crate) fn memory_read_state() -> ReadStateCache {
    ReadStateCache::new(memory_backend(), &Config::default_for_profile(Profile::Test).cache)
}

pub(crate) fn hub_test_config() -> HubConfig {
    HubConfig {
        enabled: true,
        initial_backoff_ms: 10,
        max_backoff_ms: 50,
        max_reconnect_attempts: 3,
        outbound_capacity: 16,
        ..Config::default_for_profile(Profile::Test).hub
    }
}

/// Message history filtered the same way the durable store filters it.
#[derive(Debug, Default)]
pub(crate) struct MemoryMessages {
    messages: Vec<ChatMessage>,
}

impl MemoryMessages {
    pub(crate) fn new(mut messages: Vec<ChatMessage>) -> Self {
        messages.sort_by_key(|message| message.id);
        Self { messages }
    }

    fn visible(&self, scope: ChatScope) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(move |message| {
            !message.hidden
                && message.group_type == scope.group_type
                && match scope.group_type {
                    GroupType::Private => {
                        (message.sender_id == scope.viewer && message.target_id == scope.target_id)
                            || (message.sender_id == scope.target_id
                                && message.target_id == scope.viewer)
                    }
                    _ => message.target_id == scope.target_id,
                }
        })
    }
}

#[async_trait]
impl MessageStore for MemoryMessages {
    async fn before(
        &self,
        scope: ChatScope,
        cursor: i64,
        limit: usize,
    ) -> StoreResult<Vec<ChatMessage>> {
        let older: Vec<_> = self
            .visible(scope)
            .filter(|message| message.id < cursor)
            .cloned()
            .collect();
        let skip = older.len().saturating_sub(limit);
        Ok(older.into_iter().skip(skip).collect())
    }

    async fn after(
        &self,
        scope: ChatScope,
        cursor: i64,
        limit: usize,
    ) -> StoreResult<Vec<ChatMessage>> {
        Ok(self
            .visible(scope)
            .filter(|message| message.id > cursor)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn from_inclusive(
        &self,
        scope: ChatScope,
        cursor: i64,
        limit: usize,
    ) -> StoreResult<Vec<ChatMessage>> {
        Ok(self
            .visible(scope)
            .filter(|message| message.id >= cursor)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest(&self, scope: ChatScope, limit: usize) -> StoreResult<Vec<ChatMessage>> {
        self.before(scope, i64::MAX, limit).await
    }

    async fn latest_id(&self, scope: ChatScope) -> StoreResult<Option<i64>> {
        Ok(self.visible(scope).map(|message| message.id).max())
    }

    async fn contains(&self, scope: ChatScope, message_id: i64) -> StoreResult<bool> {
        Ok(self.visible(scope).any(|message| message.id == message_id))
    }

    async fn count_unread(
        &self,
        scope: ChatScope,
        after_id: i64,
        through_id: i64,
    ) -> StoreResult<i64> {
        let count = self
            .visible(scope)
            .filter(|message| {
                message.id > after_id
                    && message.id <= through_id
                    && message.sender_id != scope.viewer
            })
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }
}

/// Receipt ledger with the `(message_id, user_id)` uniqueness of the real table.
#[derive(Debug, Default)]
pub(crate) struct MemoryReceipts {
    rows: Mutex<HashMap<(i64, i64), ReadReceipt>>,
    failing: Mutex<HashSet<i64>>,
}

impl MemoryReceipts {
    pub(crate) fn preload(&self, message_id: i64, user_id: i64) {
        self.rows.lock().unwrap().insert(
            (message_id, user_id),
            ReadReceipt {
                message_id,
                user_id,
                target_id: 0,
                group_type: GroupType::ClassGroup,
                read_at: Utc::now(),
            },
        );
    }

    pub(crate) fn fail_message(&self, message_id: i64) {
        self.failing.lock().unwrap().insert(message_id);
    }

    pub(crate) fn users_for(&self, message_id: i64) -> Vec<i64> {
        let mut users: Vec<_> = self
            .rows
            .lock()
            .unwrap()
            .keys()
            .filter(|(message, _)| *message == message_id)
            .map(|(_, user)| *user)
            .collect();
        users.sort_unstable();
        users
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait]
impl ReceiptStore for MemoryReceipts {
    async fn existing(&self, message_id: i64, users: &[i64]) -> StoreResult<HashSet<i64>> {
        let rows = self.rows.lock().unwrap();
        Ok(users
            .iter()
            .copied()
            .filter(|user| rows.contains_key(&(message_id, *user)))
            .collect())
    }

    async fn insert_batch(&self, receipts: &[ReadReceipt]) -> StoreResult<u64> {
        let failing = self.failing.lock().unwrap();
        if receipts.iter().any(|r| failing.contains(&r.message_id)) {
            return Err(StoreError::Corrupt("simulated insert failure".into()));
        }
        let mut rows = self.rows.lock().unwrap();
        let mut inserted = 0;
        for receipt in receipts {
            if !rows.contains_key(&(receipt.message_id, receipt.user_id)) {
                rows.insert((receipt.message_id, receipt.user_id), receipt.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

/// Fixed membership: rooms with explicit members and allowed private pairs.
#[derive(Debug, Default, Clone)]
pub(crate) struct StaticDirectory {
    rooms: HashMap<(GroupType, i64), Vec<i64>>,
    pairs: HashSet<(i64, i64)>,
    roles: HashMap<i64, String>,
}

impl StaticDirectory {
    pub(crate) fn with_room(mut self, group_type: GroupType, target_id: i64, members: &[i64]) -> Self {
        self.rooms.insert((group_type, target_id), members.to_vec());
        self
    }

    pub(crate) fn with_private(mut self, a: i64, b: i64) -> Self {
        self.pairs.insert((a, b));
        self.pairs.insert((b, a));
        self
    }

    pub(crate) fn with_role(mut self, user_id: i64, role: &str) -> Self {
        self.roles.insert(user_id, role.to_string());
        self
    }
}

#[async_trait]
impl MembershipDirectory for StaticDirectory {
    async fn is_member(
        &self,
        user_id: i64,
        target_id: i64,
        group_type: GroupType,
    ) -> StoreResult<bool> {
        Ok(match group_type {
            GroupType::Private => self.pairs.contains(&(user_id, target_id)),
            _ => self
                .rooms
                .get(&(group_type, target_id))
                .is_some_and(|members| members.contains(&user_id)),
        })
    }

    async fn room_members(&self, target_id: i64, group_type: GroupType) -> StoreResult<Vec<i64>> {
        Ok(self
            .rooms
            .get(&(group_type, target_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn rooms_for(&self, user_id: i64) -> StoreResult<Vec<(GroupType, i64)>> {
        let mut rooms: Vec<_> = self
            .rooms
            .iter()
            .filter(|(_, members)| members.contains(&user_id))
            .map(|(room, _)| *room)
            .collect();
        rooms.sort_by_key(|(group_type, target)| (group_type.as_str(), *target));
        Ok(rooms)
    }

    async fn audience_classes(&self, user_id: i64) -> StoreResult<Vec<AudienceClass>> {
        Ok(classes_for_role(self.roles.get(&user_id).map(String::as_str)))
    }
}

/// Cache backend that fails every call, standing in for an unreachable Redis.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct FailingCache;

fn outage<T>() -> Result<T, CacheError> {
    Err(CacheError::Unavailable("simulated outage".into()))
}

#[async_trait]
impl CacheBackend for FailingCache {
    async fn incr_with_ttl(&self, _key: &str, _ttl: Duration) -> Result<i64, CacheError> {
        outage()
    }

    async fn decr_or_delete(&self, _key: &str, _by: i64) -> Result<i64, CacheError> {
        outage()
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        outage()
    }

    async fn get_i64(&self, _key: &str) -> Result<Option<i64>, CacheError> {
        outage()
    }

    async fn set_if_greater(
        &self,
        _key: &str,
        _value: i64,
        _ttl: Duration,
    ) -> Result<Option<i64>, CacheError> {
        outage()
    }

    async fn set_counter(&self, _key: &str, _value: i64, _ttl: Duration) -> Result<(), CacheError> {
        outage()
    }

    async fn set_add(&self, _key: &str, _member: i64, _ttl: Duration) -> Result<bool, CacheError> {
        outage()
    }

    async fn set_members(&self, _key: &str) -> Result<Vec<i64>, CacheError> {
        outage()
    }

    async fn set_card(&self, _key: &str) -> Result<u64, CacheError> {
        outage()
    }

    async fn set_remove(&self, _key: &str, _members: &[i64]) -> Result<u64, CacheError> {
        outage()
    }

    async fn scan(
        &self,
        _cursor: u64,
        _pattern: &str,
        _count: usize,
    ) -> Result<(u64, Vec<String>), CacheError> {
        outage()
    }

    async fn ping(&self) -> Result<(), CacheError> {
        outage()
    }
}

/// Delivery sink that records what it was handed.
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<(AudienceKey, NormalizedEvent)>>,
}

impl RecordingSink {
    pub(crate) fn events(&self) -> Vec<(AudienceKey, NormalizedEvent)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliverySink for RecordingSink {
    async fn deliver(
        &self,
        audience: AudienceKey,
        event: NormalizedEvent,
    ) -> Result<(), DeliveryError> {
        self.events.lock().unwrap().push((audience, event));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    Fail,
    DropFirst,
    Serve,
}

/// Upstream transport driven by a fixed script.
#[derive(Debug, Clone)]
pub(crate) struct ScriptedTransport {
    script: Script,
    inbound: Vec<Invocation>,
    sent: Arc<Mutex<Vec<Invocation>>>,
    connects: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    /// Every connection succeeds, replays `inbound` and then stays open.
    pub(crate) fn new(inbound: Vec<Invocation>) -> Self {
        Self {
            script: Script::Serve,
            inbound,
            sent: Arc::default(),
            connects: Arc::default(),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            script: Script::Fail,
            ..Self::new(Vec::new())
        }
    }

    /// The first connection closes immediately; later ones stay open.
    pub(crate) fn dropping_after_first() -> Self {
        Self {
            script: Script::DropFirst,
            ..Self::new(Vec::new())
        }
    }

    pub(crate) fn sent(&self) -> Arc<Mutex<Vec<Invocation>>> {
        Arc::clone(&self.sent)
    }

    pub(crate) fn connects(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.connects)
    }
}

#[derive(Debug)]
pub(crate) struct ScriptedLink {
    inbound: VecDeque<Invocation>,
    sent: Arc<Mutex<Vec<Invocation>>>,
    closes_immediately: bool,
}

#[async_trait]
impl UpstreamTransport for ScriptedTransport {
    type Link = ScriptedLink;

    async fn connect(&self) -> Result<Self::Link, HubError> {
        if self.script == Script::Fail {
            return Err(HubError::Transport("connection refused".into()));
        }
        let previous = self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedLink {
            inbound: self.inbound.iter().cloned().collect(),
            sent: Arc::clone(&self.sent),
            closes_immediately: self.script == Script::DropFirst && previous == 0,
        })
    }
}

#[async_trait]
impl UpstreamLink for ScriptedLink {
    async fn send(&mut self, invocation: Invocation) -> Result<(), HubError> {
        self.sent.lock().unwrap().push(invocation);
        Ok(())
    }

    async fn next(&mut self) -> Option<Result<Invocation, HubError>> {
        if self.closes_immediately {
            return None;
        }
        match self.inbound.pop_front() {
            Some(invocation) => Some(Ok(invocation)),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {}
}

/// Application state over in-memory collaborators: group 7 holds users 100, 101 and 200,
/// user 100 may chat privately with user 5, user 5 is a teacher and user 1 is staff.
pub(crate) fn test_state() -> Arc<AppState> {
    test_state_with(
        MemoryMessages::new(
            (51..=55)
                .map(|id| message(id, 7, GroupType::ClassGroup, 200))
                .collect(),
        ),
        memory_backend(),
    )
}

pub(crate) fn test_state_with(
    messages: MemoryMessages,
    cache: Arc<dyn CacheBackend>,
) -> Arc<AppState> {
    let config = Config::default_for_profile(Profile::Test);
    let directory = StaticDirectory::default()
        .with_room(GroupType::ClassGroup, 7, &[100, 101, 200])
        .with_private(100, 5)
        .with_role(5, "teacher")
        .with_role(1, "staff");

    Arc::new(AppState::build(
        Dependencies {
            pool: None,
            messages: Arc::new(messages),
            receipts: Arc::new(MemoryReceipts::default()),
            directory: Arc::new(directory),
            cache,
            hub: None,
            shutdown: CancellationToken::new(),
        },
        &config,
    ))
}

/// Binds routes to `state` behind the request context middleware.
pub(crate) fn serve(routes: Router<Arc<AppState>>, state: Arc<AppState>) -> Router {
    let config = Config::default_for_profile(Profile::Test);
    routes
        .layer(middleware::from_fn_with_state(
            RequestIdState::from_config(&config),
            assign_request_id,
        ))
        .with_state(state)
}

pub(crate) fn request(
    method: &str,
    uri: &str,
    user: Option<i64>,
    body: Option<serde_json::Value>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-user-id", user.to_string());
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub(crate) async fn json_body(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
