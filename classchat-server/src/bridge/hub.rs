use std::time::Duration;

use metrics::{counter, gauge};
use serde_json::Value;
use shared::config::server::HubConfig;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{HubError, Invocation, UpstreamLink, UpstreamTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }

    fn gauge_value(self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Connected => 2.0,
            Self::Reconnecting => 3.0,
        }
    }
}

/// Cloneable handle onto the hub connection owned by [`HubSupervisor`].
#[derive(Debug, Clone)]
pub struct HubHandle {
    state: watch::Receiver<ConnectionState>,
    outbound: mpsc::Sender<Invocation>,
    inbound: broadcast::Sender<Invocation>,
}

impl HubHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Queues an outbound invocation.
    ///
    /// # Errors
    /// Fails fast with [`HubError::NotConnected`] unless the connection is up, and with
    /// [`HubError::Backpressure`] when the outbound queue is full.
    pub fn send(&self, method: &str, arguments: Value) -> Result<(), HubError> {
        if self.state() != ConnectionState::Connected {
            return Err(HubError::NotConnected);
        }
        self.outbound
            .try_send(Invocation::new(method, arguments))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => HubError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => HubError::Closed,
            })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Invocation> {
        self.inbound.subscribe()
    }
}

enum PumpOutcome {
    Shutdown,
    Lost,
}

/// Owns the upstream connection and drives its state machine:
/// `Disconnected -> Connecting -> Connected -> Reconnecting -> Connected | Disconnected`.
pub struct HubSupervisor<T: UpstreamTransport> {
    transport: T,
    config: HubConfig,
    state: watch::Sender<ConnectionState>,
    outbound: mpsc::Receiver<Invocation>,
    inbound: broadcast::Sender<Invocation>,
}

impl<T: UpstreamTransport> std::fmt::Debug for HubSupervisor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubSupervisor")
            .field("url", &self.config.url)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

/// Creates the supervisor and a handle sharing its channels.
pub fn channel<T: UpstreamTransport>(
    transport: T,
    config: HubConfig,
) -> (HubSupervisor<T>, HubHandle) {
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
    let (inbound_tx, _) = broadcast::channel(config.outbound_capacity.max(16));

    let handle = HubHandle {
        state: state_rx,
        outbound: outbound_tx,
        inbound: inbound_tx.clone(),
    };
    let supervisor = HubSupervisor {
        transport,
        config,
        state: state_tx,
        outbound: outbound_rx,
        inbound: inbound_tx,
    };
    (supervisor, handle)
}

impl<T: UpstreamTransport> HubSupervisor<T> {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
        gauge!("classchat_hub_connection_state").set(state.gauge_value());
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .config
            .initial_backoff_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.config.max_backoff_ms);
        Duration::from_millis(delay)
    }

    /// Runs until `shutdown` fires, reconnecting with exponential backoff.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut attempt: u32 = 0;
        let mut ever_connected = false;
        self.set_state(ConnectionState::Connecting);

        loop {
            let connected = tokio::select! {
                () = shutdown.cancelled() => break,
                result = self.transport.connect() => result,
            };

            match connected {
                Ok(link) => {
                    attempt = 0;
                    if ever_connected {
                        counter!("classchat_hub_reconnects_total").increment(1);
                    }
                    ever_connected = true;
                    self.set_state(ConnectionState::Connected);
                    info!(url = %self.config.url, "hub connected");

                    match self.pump(link, &shutdown).await {
                        PumpOutcome::Shutdown => break,
                        PumpOutcome::Lost => {
                            warn!("hub connection lost; reconnecting");
                            self.set_state(ConnectionState::Reconnecting);
                        }
                    }
                }
                Err(err) => {
                    attempt += 1;
                    counter!("classchat_hub_connect_failures_total").increment(1);
                    warn!(attempt, error = %err, "hub connection attempt failed");

                    let delay = if attempt >= self.config.max_reconnect_attempts {
                        self.set_state(ConnectionState::Disconnected);
                        attempt = 0;
                        Duration::from_millis(self.config.max_backoff_ms)
                    } else {
                        self.backoff(attempt)
                    };

                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }

                    if *self.state.borrow() == ConnectionState::Disconnected {
                        self.set_state(ConnectionState::Connecting);
                    }
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("hub supervisor stopped");
    }

    async fn pump(&mut self, mut link: T::Link, shutdown: &CancellationToken) -> PumpOutcome {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    link.close().await;
                    return PumpOutcome::Shutdown;
                }
                outbound = self.outbound.recv() => {
                    let Some(invocation) = outbound else {
                        link.close().await;
                        return PumpOutcome::Shutdown;
                    };
                    if let Err(err) = link.send(invocation).await {
                        warn!(error = %err, "hub send failed");
                        return PumpOutcome::Lost;
                    }
                }
                inbound = link.next() => match inbound {
                    Some(Ok(invocation)) => {
                        counter!("classchat_hub_events_received_total").increment(1);
                        // No subscribers is not an error for the connection.
                        let _ = self.inbound.send(invocation);
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "hub receive failed");
                        return PumpOutcome::Lost;
                    }
                    None => return PumpOutcome::Lost,
                },
            }
        }
    }
}
