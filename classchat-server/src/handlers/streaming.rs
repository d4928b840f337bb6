use std::{
    collections::{HashMap, VecDeque},
    convert::Infallible,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    extract::{Extension, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::{Stream, StreamExt, stream};
use metrics::{counter, gauge};
use serde::Serialize;
use serde_json::{Value, json};
use shared::{
    config::server::DeliveryConfig,
    models::{AudienceKey, GroupType, NormalizedEvent},
};
use tokio::{sync::Mutex, sync::broadcast, time::Instant};
use tokio_stream::wrappers::{BroadcastStream, IntervalStream, errors::BroadcastStreamRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    app_state::AppState,
    bridge::{DeliveryError, DeliverySink},
    http::error::{ApiError, AppResult},
    middleware::request_context::{RequestContext, require_user},
};

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SseEvent {
    sequence: Option<u64>,
    id: Option<String>,
    event: String,
    data: String,
}

impl SseEvent {
    fn ephemeral(event: &str, payload: &Value) -> Self {
        Self {
            sequence: None,
            id: None,
            event: event.to_string(),
            data: payload.to_string(),
        }
    }

    fn into_sse(self) -> Event {
        let mut builder = Event::default().event(self.event);
        if let Some(id) = self.id {
            builder = builder.id(id);
        }
        builder.data(self.data)
    }
}

struct AudienceStream {
    history: VecDeque<SseEvent>,
    /// Highest sequence evicted from `history`.
    dropped_through: Option<u64>,
    sender: broadcast::Sender<SseEvent>,
    last_active: Instant,
}

impl AudienceStream {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            history: VecDeque::new(),
            dropped_through: None,
            sender,
            last_active: Instant::now(),
        }
    }

    fn is_idle(&self) -> bool {
        self.sender.receiver_count() == 0
    }

    fn lost_after(&self, sequence: u64) -> bool {
        self.dropped_through.is_some_and(|dropped| dropped > sequence)
    }
}

struct HubState {
    next_sequence: u64,
    audiences: HashMap<AudienceKey, AudienceStream>,
    /// Highest sequence discarded together with an evicted audience.
    evicted_through: u64,
}

impl HubState {
    fn evict(&mut self, audience: &AudienceKey) {
        if let Some(stream) = self.audiences.remove(audience) {
            let newest = stream.history.back().and_then(|event| event.sequence);
            self.evicted_through = self.evicted_through.max(newest.unwrap_or(0));
        }
    }

    /// Drops audiences nobody listens to once they sat idle for `retention`, then evicts the
    /// least recently active idle audiences until at most `cap` remain.
    fn sweep(&mut self, now: Instant, retention: Duration, cap: usize) -> usize {
        let before = self.audiences.len();

        let expired: Vec<AudienceKey> = self
            .audiences
            .iter()
            .filter(|(_, stream)| {
                stream.is_idle() && now.saturating_duration_since(stream.last_active) >= retention
            })
            .map(|(audience, _)| *audience)
            .collect();
        for audience in &expired {
            self.evict(audience);
        }

        if self.audiences.len() > cap {
            let mut idle: Vec<(Instant, AudienceKey)> = self
                .audiences
                .iter()
                .filter(|(_, stream)| stream.is_idle())
                .map(|(audience, stream)| (stream.last_active, *audience))
                .collect();
            idle.sort_unstable_by_key(|(last_active, _)| *last_active);
            let excess = self.audiences.len() - cap;
            for (_, audience) in idle.into_iter().take(excess) {
                self.evict(&audience);
            }
        }

        let evicted = before - self.audiences.len();
        if evicted > 0 {
            counter!("classchat_sse_audiences_evicted_total").increment(evicted as u64);
        }
        #[allow(clippy::cast_precision_loss)]
        let resident = self.audiences.len() as f64;
        gauge!("classchat_sse_audiences").set(resident);
        evicted
    }
}

/// A live subscription across several audiences.
pub(crate) struct Subscription {
    pub(crate) stale: bool,
    pub(crate) backlog: Vec<SseEvent>,
    pub(crate) receivers: Vec<broadcast::Receiver<SseEvent>>,
}

/// Downstream delivery channels keyed by audience, with bounded per-audience replay.
pub struct DeliveryHub {
    capacity: usize,
    history_limit: usize,
    id_prefix: String,
    heartbeat: Duration,
    idle_retention: Duration,
    max_audiences: usize,
    inner: Mutex<HubState>,
}

impl std::fmt::Debug for DeliveryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryHub")
            .field("capacity", &self.capacity)
            .field("history_limit", &self.history_limit)
            .field("id_prefix", &self.id_prefix)
            .finish_non_exhaustive()
    }
}

impl DeliveryHub {
    pub fn new(config: &DeliveryConfig) -> Self {
        Self {
            capacity: config.channel_capacity.max(1),
            history_limit: config.history_limit.max(1),
            id_prefix: config.id_prefix.clone(),
            heartbeat: Duration::from_secs(config.heartbeat_seconds.max(5)),
            idle_retention: Duration::from_secs(config.idle_retention_secs.max(1)),
            max_audiences: config.max_audiences.max(1),
            inner: Mutex::new(HubState {
                next_sequence: 1,
                audiences: HashMap::new(),
                evicted_through: 0,
            }),
        }
    }

    fn parse_sequence(&self, last_id: &str) -> Option<u64> {
        last_id.strip_prefix(self.id_prefix.as_str())?.parse().ok()
    }

    /// Appends an event to an audience and broadcasts it to live subscribers.
    pub async fn publish(&self, audience: AudienceKey, event: &str, payload: &Value) -> u64 {
        let mut guard = self.inner.lock().await;
        let sequence = guard.next_sequence;
        guard.next_sequence += 1;

        let message = SseEvent {
            sequence: Some(sequence),
            id: Some(format!("{}{}", self.id_prefix, sequence)),
            event: event.to_string(),
            data: payload.to_string(),
        };

        let capacity = self.capacity;
        let channel = guard
            .audiences
            .entry(audience)
            .or_insert_with(|| AudienceStream::new(capacity));
        channel.history.push_back(message.clone());
        if channel.history.len() > self.history_limit {
            if let Some(evicted) = channel.history.pop_front() {
                channel.dropped_through = evicted.sequence;
            }
        }
        channel.last_active = Instant::now();
        // No receivers only means nobody is listening right now.
        let _ = channel.sender.send(message);

        if guard.audiences.len() > self.max_audiences {
            guard.sweep(Instant::now(), self.idle_retention, self.max_audiences);
        }
        sequence
    }

    /// Evicts idle audiences; returns how many were dropped.
    pub async fn sweep_idle(&self) -> usize {
        self.sweep_at(Instant::now()).await
    }

    async fn sweep_at(&self, now: Instant) -> usize {
        self.inner
            .lock()
            .await
            .sweep(now, self.idle_retention, self.max_audiences)
    }

    /// Periodically evicts idle audiences until `shutdown` is cancelled.
    pub async fn run_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        let period = (self.idle_retention / 2).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = self.sweep_idle().await;
                    if evicted > 0 {
                        debug!(evicted, "idle delivery audiences evicted");
                    }
                }
            }
        }
    }

    /// Subscribes to every audience and computes the replay backlog under one lock, so no
    /// event is both replayed and received live.
    pub(crate) async fn subscribe(
        &self,
        audiences: &[AudienceKey],
        last_event_id: Option<&str>,
    ) -> Subscription {
        let mut guard = self.inner.lock().await;
        let capacity = self.capacity;
        let next_sequence = guard.next_sequence;
        let evicted_through = guard.evicted_through;

        let resume_after = match last_event_id.map(str::trim).filter(|id| !id.is_empty()) {
            None => None,
            Some(id) => match self.parse_sequence(id) {
                Some(sequence) if sequence < next_sequence => Some(Some(sequence)),
                _ => Some(None),
            },
        };

        let mut stale = matches!(resume_after, Some(None));
        let mut backlog = Vec::new();
        let mut receivers = Vec::with_capacity(audiences.len());

        for audience in audiences {
            let resident = guard.audiences.contains_key(audience);
            let channel = guard
                .audiences
                .entry(*audience)
                .or_insert_with(|| AudienceStream::new(capacity));
            channel.last_active = Instant::now();
            receivers.push(channel.sender.subscribe());

            if let Some(Some(after)) = resume_after {
                if channel.lost_after(after) || (!resident && after < evicted_through) {
                    stale = true;
                }
                backlog.extend(
                    channel
                        .history
                        .iter()
                        .filter(|event| event.sequence.is_some_and(|seq| seq > after))
                        .cloned(),
                );
            }
        }

        if stale {
            backlog.clear();
        }
        backlog.sort_by_key(|event| event.sequence);

        Subscription {
            stale,
            backlog,
            receivers,
        }
    }

    #[cfg(test)]
    async fn audiences(&self) -> usize {
        self.inner.lock().await.audiences.len()
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    audience: AudienceKey,
    event: &'a NormalizedEvent,
}

#[async_trait]
impl DeliverySink for DeliveryHub {
    async fn deliver(
        &self,
        audience: AudienceKey,
        event: NormalizedEvent,
    ) -> Result<(), DeliveryError> {
        let payload = serde_json::to_value(Envelope {
            audience,
            event: &event,
        })
        .map_err(|source| DeliveryError::Encode { audience, source })?;
        let sequence = self.publish(audience, &event.method, &payload).await;
        debug!(%audience, sequence, "event published");
        Ok(())
    }
}

fn stale_cursor_event() -> SseEvent {
    SseEvent::ephemeral(
        "error",
        &json!({
            "message": "Event history no longer available; please reload.",
            "reason": "stale_cursor"
        }),
    )
}

fn live_events(
    receivers: Vec<broadcast::Receiver<SseEvent>>,
) -> impl Stream<Item = SseEvent> + Send + 'static {
    stream::select_all(receivers.into_iter().map(BroadcastStream::new)).filter_map(
        |received| async move {
            match received {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    counter!("classchat_sse_lagged_events_total").increment(skipped);
                    warn!(skipped, "sse subscriber lagged; events skipped");
                    None
                }
            }
        },
    )
}

fn heartbeats(period: Duration) -> impl Stream<Item = SseEvent> + Send + 'static {
    let interval = tokio::time::interval_at(Instant::now() + period, period);
    IntervalStream::new(interval).map(|_| SseEvent::ephemeral("ping", &json!({})))
}

/// Preamble, then live events and heartbeats, ending once `shutdown` is cancelled.
fn event_stream(
    preamble: Vec<SseEvent>,
    receivers: Vec<broadcast::Receiver<SseEvent>>,
    heartbeat: Duration,
    shutdown: CancellationToken,
) -> impl Stream<Item = SseEvent> + Send + 'static {
    let live = stream::select(live_events(receivers), heartbeats(heartbeat));
    stream::iter(preamble)
        .chain(live)
        .take_until(shutdown.cancelled_owned())
}

/// Audiences a user listens to: their private channel, their rooms and their classes.
async fn audiences_for(state: &AppState, user_id: i64) -> AppResult<Vec<AudienceKey>> {
    let mut audiences = vec![AudienceKey::Private(user_id)];
    let rooms = state.directory.rooms_for(user_id).await.map_err(ApiError::from)?;
    audiences.extend(
        rooms
            .into_iter()
            .filter(|(group_type, _)| *group_type != GroupType::Private)
            .map(|(group_type, target_id)| AudienceKey::for_target(group_type, target_id)),
    );
    let classes = state
        .directory
        .audience_classes(user_id)
        .await
        .map_err(ApiError::from)?;
    audiences.extend(classes.into_iter().map(AudienceKey::Class));
    audiences.dedup();
    Ok(audiences)
}

/// Server-sent events stream of normalized chat events for the calling user.
#[utoipa::path(
    get,
    path = "/api/stream",
    responses(
        (status = 200, description = "Event stream", content_type = "text/event-stream"),
        (status = 401, description = "Missing caller identity")
    ),
    tag = "Stream"
)]
pub async fn sse_handler(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    headers: HeaderMap,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let user_id = require_user(&context)?;
    let audiences = audiences_for(&state, user_id).await?;

    let last_event_id = headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string);

    let hub = Arc::clone(&state.delivery);
    let subscription = hub.subscribe(&audiences, last_event_id.as_deref()).await;
    info!(
        user_id,
        audiences = audiences.len(),
        replayed = subscription.backlog.len(),
        stale = subscription.stale,
        "sse stream established"
    );

    let mut preamble = Vec::with_capacity(subscription.backlog.len() + 2);
    if subscription.stale {
        preamble.push(stale_cursor_event());
    }
    preamble.extend(subscription.backlog);
    preamble.push(SseEvent::ephemeral(
        "message",
        &json!({ "type": "connection", "message": "Connected to event stream" }),
    ));

    let events = event_stream(
        preamble,
        subscription.receivers,
        hub.heartbeat,
        state.shutdown.clone(),
    )
    .map(|event| Ok::<_, Infallible>(event.into_sse()));

    let keepalive = KeepAlive::new().interval(hub.heartbeat).text("keep-alive");
    Ok(Sse::new(events).keep_alive(keepalive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{
        config::server::{Config, Profile},
        models::AudienceClass,
    };
    use tokio::time::timeout;

    fn hub_with_history(history_limit: usize) -> DeliveryHub {
        let mut config = Config::default_for_profile(Profile::Test).delivery;
        config.history_limit = history_limit;
        DeliveryHub::new(&config)
    }

    fn hub_with_cap(max_audiences: usize) -> DeliveryHub {
        let mut config = Config::default_for_profile(Profile::Test).delivery;
        config.max_audiences = max_audiences;
        DeliveryHub::new(&config)
    }

    #[tokio::test]
    async fn idle_audiences_are_swept_after_retention() {
        let hub = hub_with_history(8);
        for user in [1, 2, 3] {
            hub.publish(AudienceKey::Private(user), "ReceiveMessage", &json!({"id": user}))
                .await;
        }
        let _listening = hub.subscribe(&[AudienceKey::Private(2)], None).await;

        assert_eq!(hub.sweep_at(Instant::now()).await, 0);
        let later = Instant::now() + hub.idle_retention + Duration::from_secs(1);
        assert_eq!(hub.sweep_at(later).await, 2);
        assert_eq!(hub.audiences().await, 1);
    }

    #[tokio::test]
    async fn unsubscribed_audiences_stay_within_the_cap() {
        let hub = hub_with_cap(4);
        for user in 0..1_000 {
            hub.publish(AudienceKey::Private(user), "ReceiveMessage", &json!({"id": user}))
                .await;
        }
        assert!(hub.audiences().await <= 4);
    }

    #[tokio::test]
    async fn resuming_into_an_evicted_audience_is_stale() {
        let hub = hub_with_cap(1);
        hub.publish(AudienceKey::Private(5), "ReceiveMessage", &json!({"id": 1}))
            .await;
        hub.publish(AudienceKey::Private(6), "ReceiveMessage", &json!({"id": 2}))
            .await;
        hub.publish(AudienceKey::Private(7), "ReceiveMessage", &json!({"id": 3}))
            .await;

        let resumed = hub.subscribe(&[AudienceKey::Private(6)], Some("evt-1")).await;
        assert!(resumed.stale);
        assert!(resumed.backlog.is_empty());
    }

    #[tokio::test]
    async fn cancelled_shutdown_ends_the_event_stream() {
        let hub = hub_with_history(8);
        let subscription = hub.subscribe(&[AudienceKey::Group(7)], None).await;
        let shutdown = CancellationToken::new();
        let events = event_stream(
            vec![SseEvent::ephemeral("message", &json!({}))],
            subscription.receivers,
            Duration::from_secs(60),
            shutdown.clone(),
        );

        shutdown.cancel();
        let collected = timeout(Duration::from_secs(1), events.collect::<Vec<_>>())
            .await
            .expect("stream should end after shutdown");
        assert!(collected.is_empty());
    }

    #[tokio::test]
    async fn live_stream_runs_until_shutdown() {
        let hub = hub_with_history(8);
        let subscription = hub.subscribe(&[AudienceKey::Group(7)], None).await;
        let shutdown = CancellationToken::new();
        let mut events = Box::pin(event_stream(
            Vec::new(),
            subscription.receivers,
            Duration::from_secs(60),
            shutdown.clone(),
        ));

        hub.publish(AudienceKey::Group(7), "ReceiveMessage", &json!({"id": 1}))
            .await;
        let first = timeout(Duration::from_secs(1), events.next()).await.unwrap();
        assert_eq!(first.map(|event| event.event), Some("ReceiveMessage".to_string()));

        shutdown.cancel();
        let end = timeout(Duration::from_secs(1), events.next()).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn live_subscribers_receive_published_events() {
        let hub = hub_with_history(8);
        let mut subscription = hub.subscribe(&[AudienceKey::Group(7)], None).await;
        assert!(subscription.backlog.is_empty());

        hub.publish(AudienceKey::Group(7), "ReceiveMessage", &json!({"id": 1}))
            .await;
        hub.publish(AudienceKey::Group(8), "ReceiveMessage", &json!({"id": 2}))
            .await;

        let event = timeout(Duration::from_secs(1), subscription.receivers[0].recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event, "ReceiveMessage");
        assert_eq!(event.id.as_deref(), Some("evt-1"));
        assert!(subscription.receivers[0].try_recv().is_err());
    }

    #[tokio::test]
    async fn resume_replays_only_newer_events_across_audiences() {
        let hub = hub_with_history(8);
        hub.publish(AudienceKey::Private(5), "ReceiveMessage", &json!({"id": 1}))
            .await;
        hub.publish(AudienceKey::Group(7), "ReceiveMessage", &json!({"id": 2}))
            .await;
        hub.publish(AudienceKey::Private(5), "MessageUpdated", &json!({"id": 1}))
            .await;

        let subscription = hub
            .subscribe(&[AudienceKey::Private(5), AudienceKey::Group(7)], Some("evt-1"))
            .await;
        assert!(!subscription.stale);
        let ids: Vec<_> = subscription
            .backlog
            .iter()
            .filter_map(|event| event.id.clone())
            .collect();
        assert_eq!(ids, vec!["evt-2", "evt-3"]);
    }

    #[tokio::test]
    async fn evicted_history_marks_the_cursor_stale() {
        let hub = hub_with_history(2);
        for id in 1..=4 {
            hub.publish(AudienceKey::Group(7), "ReceiveMessage", &json!({"id": id}))
                .await;
        }

        let subscription = hub.subscribe(&[AudienceKey::Group(7)], Some("evt-1")).await;
        assert!(subscription.stale);
        assert!(subscription.backlog.is_empty());

        let unknown = hub
            .subscribe(&[AudienceKey::Group(7)], Some("bogus-id"))
            .await;
        assert!(unknown.stale);

        let current = hub.subscribe(&[AudienceKey::Group(7)], Some("evt-3")).await;
        assert!(!current.stale);
        assert_eq!(current.backlog.len(), 1);
    }

    #[tokio::test]
    async fn delivery_sink_wraps_audience_and_event() {
        let hub = hub_with_history(8);
        let mut subscription = hub
            .subscribe(&[AudienceKey::Class(AudienceClass::Teachers)], None)
            .await;
        let event = crate::bridge::payload::normalize(
            "ReceiveMessage",
            &json!({"id": 3, "type": "AllTeachers"}),
        )
        .unwrap();

        hub.deliver(AudienceKey::Class(AudienceClass::Teachers), event)
            .await
            .unwrap();

        let received = subscription.receivers[0].recv().await.unwrap();
        let payload: Value = serde_json::from_str(&received.data).unwrap();
        assert_eq!(payload["audience"], "teachers");
        assert_eq!(payload["event"]["message_id"], 3);
        assert_eq!(hub.audiences().await, 1);
    }

    #[tokio::test]
    async fn sse_handler_requires_user() {
        let state = crate::fixtures::test_state();
        let context = RequestContext {
            request_id: "req-1".into(),
            user_id: None,
        };

        let result = sse_handler(State(state), Extension(context), HeaderMap::new()).await;
        assert_eq!(
            result.err().map(|err| err.status()),
            Some(axum::http::StatusCode::UNAUTHORIZED)
        );
    }
}
