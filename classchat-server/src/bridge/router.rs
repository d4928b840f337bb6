use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use metrics::counter;
use shared::models::{GroupType, MessageKind, NormalizedEvent};
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{
    DeliverySink, EventError, Invocation,
    audience::{self, Delivery},
    payload,
};
use crate::{cache::ReadStateCache, store::MembershipDirectory};

/// Turns upstream invocations into unread side effects and per-audience deliveries.
#[derive(Clone)]
pub struct FanoutRouter {
    cache: ReadStateCache,
    directory: Arc<dyn MembershipDirectory>,
    sink: Arc<dyn DeliverySink>,
    event_timeout: Duration,
    in_flight: Arc<Semaphore>,
}

impl std::fmt::Debug for FanoutRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutRouter")
            .field("event_timeout", &self.event_timeout)
            .field("available_permits", &self.in_flight.available_permits())
            .finish_non_exhaustive()
    }
}

impl FanoutRouter {
    pub fn new(
        cache: ReadStateCache,
        directory: Arc<dyn MembershipDirectory>,
        sink: Arc<dyn DeliverySink>,
        event_timeout: Duration,
        max_in_flight: usize,
    ) -> Self {
        Self {
            cache,
            directory,
            sink,
            event_timeout,
            in_flight: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// Processes one invocation and returns how many deliveries succeeded.
    ///
    /// # Errors
    /// Returns [`EventError::Malformed`] when the payload cannot be normalized or addressed.
    /// Delivery failures are logged per audience and never fail the event.
    #[instrument(name = "bridge.handle", skip(self, invocation), fields(method = %invocation.target))]
    pub async fn handle(&self, invocation: Invocation) -> Result<usize, EventError> {
        let deliveries = payload::normalize(&invocation.target, &invocation.arguments)
            .and_then(|event| audience::resolve(&event).map(|deliveries| (event, deliveries)));

        let (event, deliveries) = match deliveries {
            Ok(resolved) => resolved,
            Err(err) => {
                counter!("classchat_malformed_events_total").increment(1);
                warn!(error = %err, "dropping malformed hub event");
                return Err(err);
            }
        };

        if event.action.counts_as_unread() {
            self.apply_unread(&event).await;
        }

        Ok(self.deliver_all(deliveries).await)
    }

    async fn apply_unread(&self, event: &NormalizedEvent) {
        let (Some(sender), Some(target)) = (event.sender_id, event.target_id) else {
            return;
        };

        match event.kind {
            MessageKind::Private => {
                if target != sender {
                    self.cache
                        .increment_unread(target, sender, GroupType::Private)
                        .await;
                }
            }
            MessageKind::Group | MessageKind::Channel => {
                let group_type = match event.group_type {
                    Some(GroupType::Private) | None if event.kind == MessageKind::Group => {
                        GroupType::ClassGroup
                    }
                    Some(GroupType::Private) | None => GroupType::Channel,
                    Some(group_type) => group_type,
                };
                match self.directory.room_members(target, group_type).await {
                    Ok(members) => {
                        let increments = members
                            .into_iter()
                            .filter(|member| *member != sender)
                            .map(|member| self.cache.increment_unread(member, target, group_type));
                        join_all(increments).await;
                    }
                    Err(err) => {
                        warn!(
                            target_id = target,
                            %group_type,
                            error = %err,
                            "room membership lookup failed; unread counters not updated"
                        );
                    }
                }
            }
            _ => {}
        }
    }

    async fn deliver_all(&self, deliveries: Vec<Delivery>) -> usize {
        let results = join_all(deliveries.into_iter().map(|delivery| {
            let sink = Arc::clone(&self.sink);
            async move {
                let audience = delivery.audience;
                match sink.deliver(delivery.audience, delivery.event).await {
                    Ok(()) => {
                        counter!("classchat_deliveries_total", "outcome" => "ok").increment(1);
                        true
                    }
                    Err(err) => {
                        counter!("classchat_deliveries_total", "outcome" => "error").increment(1);
                        warn!(%audience, error = %err, "delivery failed");
                        false
                    }
                }
            }
        }))
        .await;

        results.into_iter().filter(|delivered| *delivered).count()
    }

    /// Consumes inbound invocations until the channel closes or `shutdown` fires.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: broadcast::Receiver<Invocation>,
        shutdown: CancellationToken,
    ) {
        loop {
            let invocation = tokio::select! {
                () = shutdown.cancelled() => break,
                received = inbound.recv() => match received {
                    Ok(invocation) => invocation,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        counter!("classchat_hub_events_lagged_total").increment(skipped);
                        warn!(skipped, "fan-out router lagged behind the hub");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            let permit = tokio::select! {
                () = shutdown.cancelled() => break,
                permit = Arc::clone(&self.in_flight).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let router = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                let method = invocation.target.clone();
                match tokio::time::timeout(router.event_timeout, router.handle(invocation)).await {
                    Ok(Ok(delivered)) => debug!(%method, delivered, "hub event fanned out"),
                    Ok(Err(_)) => {}
                    Err(_) => {
                        counter!("classchat_event_timeouts_total").increment(1);
                        warn!(%method, "hub event processing timed out");
                    }
                }
            });
        }
        debug!("fan-out router stopped");
    }
}
