//! Live event subscriptions over polling log filters.
//!
//! A single poller task per subscription pulls filter changes from the
//! gateway and feeds them, in delivery order, into a bounded channel with
//! exactly one consumer. Nothing is reordered or deduplicated here.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::filter::EventFilter;
use super::gateway::{FilterId, LedgerEvent, LedgerGateway};
use crate::error::{AgentError, Result};
use crate::shutdown::ShutdownToken;

/// Receives matched events from [`EventSubscription::dispatch`].
///
/// Returning an error reports it; it never stops the subscription.
#[async_trait]
pub trait EventHandler: Send {
    async fn handle(&mut self, event: LedgerEvent) -> Result<()>;
}

/// Options for a subscription
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionConfig {
    pub poll_interval: Duration,
    /// Events buffered between poller and consumer
    pub capacity: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            capacity: 64,
        }
    }
}

/// A live filter plus its delivery channel
pub struct EventSubscription {
    filter: EventFilter,
    gateway: Arc<dyn LedgerGateway>,
    filter_id: Arc<Mutex<FilterId>>,
    events: mpsc::Receiver<LedgerEvent>,
    stop_tx: watch::Sender<bool>,
    poller: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription")
            .field("event", &self.filter.event_name)
            .field("from_block", &self.filter.from_block)
            .field("active", &self.is_active())
            .finish()
    }
}

impl EventSubscription {
    /// Install `filter` on the gateway and start delivering its matches
    pub async fn subscribe(
        gateway: Arc<dyn LedgerGateway>,
        filter: EventFilter,
        config: SubscriptionConfig,
    ) -> Result<Self> {
        let id = gateway.install_filter(&filter).await.map_err(|e| match e {
            AgentError::FilterCreation { .. } => e,
            other => AgentError::FilterCreation {
                event: filter.event_name.clone(),
                reason: other.to_string(),
            },
        })?;

        info!(
            "Subscribed to {} (filter {}, fromBlock {})",
            filter.event_name, id, filter.from_block
        );

        let filter_id = Arc::new(Mutex::new(id));
        let (tx, events) = mpsc::channel(config.capacity.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);

        let poller = tokio::spawn(poll_filter(
            gateway.clone(),
            filter.clone(),
            filter_id.clone(),
            tx,
            stop_rx,
            config.poll_interval,
        ));

        Ok(Self {
            filter,
            gateway,
            filter_id,
            events,
            stop_tx,
            poller: Some(poller),
        })
    }

    pub fn is_active(&self) -> bool {
        self.poller.is_some()
    }

    /// Next matched event; `None` once unsubscribed
    pub async fn next_event(&mut self) -> Option<LedgerEvent> {
        if !self.is_active() {
            return None;
        }
        self.events.recv().await
    }

    /// Drive `handler` once per event until shutdown.
    ///
    /// No event is handed to the handler after shutdown has been observed;
    /// an event already being handled runs to completion. The filter stays
    /// installed until [`unsubscribe`](Self::unsubscribe).
    pub async fn dispatch<H>(&mut self, handler: &mut H, shutdown: &mut ShutdownToken)
    where
        H: EventHandler + ?Sized,
    {
        while self.is_active() {
            let event = tokio::select! {
                biased;
                _ = shutdown.wait_for_shutdown() => break,
                event = self.events.recv() => event,
            };

            let Some(event) = event else {
                break;
            };
            if shutdown.is_shutdown_requested() {
                break;
            }

            if let Err(e) = handler.handle(event).await {
                error!("{} handler failed: {}", self.filter.event_name, e);
            }
        }
    }

    /// Stop delivery and remove the filter from the node. Safe to repeat.
    pub async fn unsubscribe(&mut self) {
        let Some(poller) = self.poller.take() else {
            return;
        };

        let _ = self.stop_tx.send(true);
        if let Err(e) = poller.await {
            warn!("{} poller ended abnormally: {}", self.filter.event_name, e);
        }
        self.events.close();

        let id = *self.filter_id.lock().await;
        match self.gateway.uninstall_filter(id).await {
            Ok(true) => info!("Unsubscribed from {} (filter {})", self.filter.event_name, id),
            Ok(false) => debug!("Filter {} was already gone from the node", id),
            Err(e) => warn!("Failed to uninstall filter {}: {}", id, e),
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
            warn!(
                "{} subscription dropped without unsubscribe; filter left to expire on the node",
                self.filter.event_name
            );
        }
    }
}

async fn poll_filter(
    gateway: Arc<dyn LedgerGateway>,
    filter: EventFilter,
    filter_id: Arc<Mutex<FilterId>>,
    tx: mpsc::Sender<LedgerEvent>,
    mut stop_rx: watch::Receiver<bool>,
    poll_interval: Duration,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_block: Option<u64> = None;

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => return,
            _ = ticker.tick() => {}
        }
        if *stop_rx.borrow() {
            return;
        }

        let id = *filter_id.lock().await;
        let changes = tokio::select! {
            biased;
            _ = stop_rx.changed() => return,
            changes = gateway.filter_changes(id) => changes,
        };

        match changes {
            Ok(events) => {
                for event in events {
                    if event.block_number.is_some() {
                        last_block = event.block_number;
                    }
                    tokio::select! {
                        biased;
                        _ = stop_rx.changed() => return,
                        sent = tx.send(event) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            Err(AgentError::FilterNotFound(_)) => {
                // Nodes drop idle filters; reinstall past the last delivered block
                let resume = last_block.map_or(filter.from_block, |b| b + 1);
                match gateway.install_filter(&filter.resumed_at(resume)).await {
                    Ok(new_id) => {
                        warn!(
                            "{} filter {} expired, reinstalled as {} from block {}",
                            filter.event_name, id, new_id, resume
                        );
                        *filter_id.lock().await = new_id;
                    }
                    Err(e) => warn!("Failed to reinstall {} filter: {}", filter.event_name, e),
                }
            }
            Err(e) => {
                warn!("Polling {} filter {} failed: {}", filter.event_name, id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::filter::{EventSchema, COMMAND_PENDING_EVENT};
    use crate::ledger::memory::InMemoryLedger;
    use crate::shutdown::{GracefulShutdown, ShutdownSignal};
    use crate::testing::{self, command_log, CONTRACT};
    use alloy::primitives::U256;

    fn command_schema() -> EventSchema {
        EventSchema::resolve(&testing::coordinator_abi(), COMMAND_PENDING_EVENT).unwrap()
    }

    fn command_filter(from_block: u64) -> EventFilter {
        EventFilter::new(&command_schema(), CONTRACT, vec![testing::requester()], from_block)
            .unwrap()
    }

    fn fast() -> SubscriptionConfig {
        SubscriptionConfig {
            poll_interval: Duration::from_millis(10),
            capacity: 8,
        }
    }

    struct Recorder {
        seen: Vec<U256>,
        fail_on: Option<U256>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&mut self, event: LedgerEvent) -> Result<()> {
            let cmd_id = command_schema().decode(&event)?.uint("cmdId")?;
            self.seen.push(cmd_id);
            if self.fail_on == Some(cmd_id) {
                return Err(AgentError::Execution("boom".into()));
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_delivered_in_order() {
        let ledger = Arc::new(InMemoryLedger::new(CONTRACT));
        let mut sub = EventSubscription::subscribe(ledger.clone(), command_filter(0), fast())
            .await
            .unwrap();

        for id in 1..=3u64 {
            ledger.emit(command_log(testing::requester(), U256::from(id), b"cmd"));
        }

        let schema = command_schema();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let event = sub.next_event().await.unwrap();
            ids.push(schema.decode(&event).unwrap().uint("cmdId").unwrap());
        }
        assert_eq!(ids, vec![U256::from(1), U256::from(2), U256::from(3)]);

        sub.unsubscribe().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_filter_is_filter_creation_error() {
        let ledger = Arc::new(InMemoryLedger::new(CONTRACT));
        ledger.reject_filters(true);

        let err = EventSubscription::subscribe(ledger.clone(), command_filter(0), fast())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::FilterCreation { .. }));
        assert_eq!(ledger.active_filters(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_is_idempotent() {
        let ledger = Arc::new(InMemoryLedger::new(CONTRACT));
        let mut sub = EventSubscription::subscribe(ledger.clone(), command_filter(0), fast())
            .await
            .unwrap();
        assert_eq!(ledger.active_filters(), 1);
        assert!(format!("{:?}", sub).contains("active: true"));

        sub.unsubscribe().await;
        sub.unsubscribe().await;
        assert!(format!("{:?}", sub).contains("active: false"));

        assert!(!sub.is_active());
        assert_eq!(ledger.active_filters(), 0);
        assert!(sub.next_event().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_error_does_not_stop_watching() {
        let ledger = Arc::new(InMemoryLedger::new(CONTRACT));
        let mut sub = EventSubscription::subscribe(ledger.clone(), command_filter(0), fast())
            .await
            .unwrap();
        let shutdown = Arc::new(GracefulShutdown::with_defaults());
        let mut token = shutdown.token();

        for id in 1..=3u64 {
            ledger.emit(command_log(testing::requester(), U256::from(id), b"cmd"));
        }

        let mut handler = Recorder {
            seen: Vec::new(),
            fail_on: Some(U256::from(2)),
        };

        let stopper = {
            let shutdown = shutdown.clone();
            let ledger = ledger.clone();
            tokio::spawn(async move {
                while ledger.delivered() < 3 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                shutdown.request_shutdown(ShutdownSignal::Graceful);
            })
        };

        sub.dispatch(&mut handler, &mut token).await;
        stopper.await.unwrap();
        sub.unsubscribe().await;

        assert_eq!(handler.seen, vec![U256::from(1), U256::from(2), U256::from(3)]);
        assert!(!sub.is_active());
        assert_eq!(ledger.active_filters(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_filter_is_reinstalled() {
        let ledger = Arc::new(InMemoryLedger::new(CONTRACT));
        let mut sub = EventSubscription::subscribe(ledger.clone(), command_filter(0), fast())
            .await
            .unwrap();

        ledger.emit(command_log(testing::requester(), U256::from(1), b"first"));
        assert!(sub.next_event().await.is_some());

        ledger.expire_filters();
        ledger.emit(command_log(testing::requester(), U256::from(2), b"second"));

        let schema = command_schema();
        let event = sub.next_event().await.unwrap();
        assert_eq!(schema.decode(&event).unwrap().uint("cmdId").unwrap(), U256::from(2));

        sub.unsubscribe().await;
        assert_eq!(ledger.active_filters(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_are_retried() {
        let ledger = Arc::new(InMemoryLedger::new(CONTRACT));
        let mut sub = EventSubscription::subscribe(ledger.clone(), command_filter(0), fast())
            .await
            .unwrap();

        ledger.fail_polls(2);
        ledger.emit(command_log(testing::requester(), U256::from(5), b"late"));

        assert!(sub.next_event().await.is_some());
        sub.unsubscribe().await;
    }
}
