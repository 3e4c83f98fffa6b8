//! Subscription Refresh Protocol
//!
//! Every refresh is a full rebuild: tear the session down, re-read the
//! registry, reconnect, resubscribe, then swap in a new topic index.
//!
//! # Cycle
//!
//! ```text
//! Pending ──► TornDown ──► Resolved ──► Online ──► Subscribed ──► (index swap)
//!                            │            │
//!                            └─ registry  └─ connect
//!                               error        error
//! ```
//!
//! # Coordination
//!
//! Requests bump a monotonically increasing epoch held in a `watch`
//! channel. A single coordinator task runs one cycle at a time with the
//! latest epoch; requests that arrive meanwhile collapse into one follow-up
//! cycle. A cycle that finds a newer epoch pending at a checkpoint gives up
//! without reporting, and an index swap only lands if its epoch is newer
//! than the installed one.

use super::router::{RefreshOutcome, RouterHandle};
use super::topic_resolver::{resolve, TopicSet};
use super::topic_state::TopicStateIndex;
use crate::mqtt::config::ConnectOptions;
use crate::mqtt::error::{RefreshFailed, SubscribeError};
use crate::mqtt::mqtt_handler::{SessionHandle, SessionState};
use crate::registry::{DeviceFilter, DeviceRegistry};
use rumqttc::QoS;
use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of a completed refresh cycle
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshReport {
    pub epoch: u64,
    pub subscribed: Vec<String>,
    /// Topics whose subscribe failed; the rest of the cycle still ran
    pub failed: Vec<(String, SubscribeError)>,
}

impl RefreshReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum RefreshPhase {
    Pending,    // Requested, session untouched
    TornDown,   // Old session released, state is Refreshing
    Resolved,   // Topic set computed from the registry
    Online,     // Reconnected
    Subscribed, // Every topic attempted
}

/// One pass through the refresh protocol, one epoch
#[machine]
pub struct RefreshCycle<S: RefreshPhase> {
    epoch: u64,
    session: SessionHandle,
    topics: TopicSet,
    subscribed: Vec<String>,
    failed: Vec<(String, SubscribeError)>,
}

impl<S: RefreshPhase> RefreshCycle<S> {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl RefreshCycle<Pending> {
    pub fn begin(epoch: u64, session: SessionHandle) -> Self {
        Self::new(epoch, session, TopicSet::default(), Vec::new(), Vec::new())
    }

    /// Disconnects a live session; always completes before any reconnect
    pub async fn tear_down(self) -> RefreshCycle<TornDown> {
        if self.session.state() == SessionState::Connected {
            debug!("Refresh {}: closing current session", self.epoch);
            self.session.disconnect().await;
        }
        if !self.session.mark_refreshing() {
            warn!(
                "Refresh {}: session is {:?}, not disconnected",
                self.epoch,
                self.session.state()
            );
        }
        self.transition()
    }
}

impl RefreshCycle<TornDown> {
    pub async fn resolve(
        mut self,
        registry: &dyn DeviceRegistry,
    ) -> Result<RefreshCycle<Resolved>, RefreshFailed> {
        match registry.list_devices(DeviceFilter::sensors()).await {
            Ok(records) => {
                self.topics = resolve(&records);
                debug!(
                    "Refresh {}: {} topic(s) from {} sensor(s)",
                    self.epoch,
                    self.topics.len(),
                    records.len()
                );
                Ok(self.transition())
            }
            Err(e) => {
                self.session.abandon_refresh();
                Err(RefreshFailed::Registry(e.to_string()))
            }
        }
    }
}

impl RefreshCycle<Resolved> {
    /// Gives up before connecting and returns the session to `Disconnected`
    pub fn abandon(self) {
        self.session.abandon_refresh();
    }

    /// No retry; a failed connect ends the cycle
    pub async fn connect(
        self,
        options: ConnectOptions,
    ) -> Result<RefreshCycle<Online>, RefreshFailed> {
        match self.session.connect(options).await {
            Ok(connected) => {
                debug!("Refresh {}: connected to {}", self.epoch, connected.broker);
                Ok(self.transition())
            }
            Err(e) => {
                self.session.abandon_refresh();
                Err(RefreshFailed::Connect(e))
            }
        }
    }
}

impl RefreshCycle<Online> {
    /// Subscribes sequentially; a failed topic is recorded and skipped
    pub async fn subscribe_all(mut self, qos: QoS) -> RefreshCycle<Subscribed> {
        for topic in self.topics.iter() {
            match self.session.subscribe(topic, qos).await {
                Ok(()) => self.subscribed.push(topic.to_string()),
                Err(e) => {
                    warn!("Refresh {}: subscribe to {} failed: {}", self.epoch, topic, e);
                    self.failed.push((topic.to_string(), e));
                }
            }
        }
        self.transition()
    }
}

impl RefreshCycle<Subscribed> {
    /// Installs the new index unless a newer epoch already did
    ///
    /// Returns `None` when the cycle is stale and its index was discarded.
    pub fn swap(self, index: &watch::Sender<Arc<TopicStateIndex>>) -> Option<RefreshReport> {
        let swapped = index.send_if_modified(|current| {
            if current.epoch() >= self.epoch {
                return false;
            }
            *current = Arc::new(TopicStateIndex::build(self.epoch, &self.topics));
            true
        });

        if !swapped {
            warn!("Refresh {}: newer index installed, discarding", self.epoch);
            return None;
        }

        Some(RefreshReport {
            epoch: self.epoch,
            subscribed: self.subscribed,
            failed: self.failed,
        })
    }
}

#[derive(Debug, Clone)]
struct CompletedRefresh {
    epoch: u64,
    result: RefreshOutcome,
}

/// Refresh timing and session parameters
#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub options: ConnectOptions,
    pub subscribe_qos: QoS,
    /// Minimum spacing between the starts of two cycles
    pub min_interval: Duration,
}

/// Cloneable front of the refresh coordinator
#[derive(Clone)]
pub struct RefreshHandle {
    requests: Arc<watch::Sender<u64>>,
    outcomes: watch::Receiver<Option<CompletedRefresh>>,
}

impl RefreshHandle {
    /// Queues a refresh and returns its epoch without waiting
    pub fn request(&self) -> u64 {
        let mut epoch = 0;
        self.requests.send_modify(|latest| {
            *latest += 1;
            epoch = *latest;
        });
        debug!("Refresh {} requested", epoch);
        epoch
    }

    /// Outcome of the first cycle at or past `epoch`
    pub async fn outcome(&self, epoch: u64) -> RefreshOutcome {
        let mut outcomes = self.outcomes.clone();
        let completed = match outcomes
            .wait_for(|done| done.as_ref().is_some_and(|done| done.epoch >= epoch))
            .await
        {
            Ok(done) => done.as_ref().map(|done| done.result.clone()),
            Err(_) => None,
        };
        completed.unwrap_or(Err(RefreshFailed::SessionClosed))
    }

    pub async fn refresh(&self) -> RefreshOutcome {
        let epoch = self.request();
        self.outcome(epoch).await
    }

    /// Epoch of the last completed cycle, if any
    pub fn last_completed(&self) -> Option<u64> {
        self.outcomes.borrow().as_ref().map(|done| done.epoch)
    }
}

pub struct RefreshCoordinator {
    session: SessionHandle,
    registry: Arc<dyn DeviceRegistry>,
    settings: RefreshSettings,
    requests: watch::Receiver<u64>,
    index: watch::Sender<Arc<TopicStateIndex>>,
    outcomes: watch::Sender<Option<CompletedRefresh>>,
    router: RouterHandle,
}

impl RefreshCoordinator {
    pub fn spawn(
        session: SessionHandle,
        registry: Arc<dyn DeviceRegistry>,
        settings: RefreshSettings,
        index: watch::Sender<Arc<TopicStateIndex>>,
        router: RouterHandle,
        shutdown: CancellationToken,
    ) -> (RefreshHandle, JoinHandle<()>) {
        let requests = Arc::new(watch::Sender::new(0u64));
        let (outcomes_tx, outcomes_rx) = watch::channel(None);

        let coordinator = Self {
            session,
            registry,
            settings,
            requests: requests.subscribe(),
            index,
            outcomes: outcomes_tx,
            router,
        };
        let task = tokio::spawn(coordinator.run(shutdown));

        (
            RefreshHandle {
                requests,
                outcomes: outcomes_rx,
            },
            task,
        )
    }

    fn latest_request(&self) -> u64 {
        *self.requests.borrow()
    }

    fn superseded(&self, epoch: u64) -> bool {
        self.latest_request() > epoch
    }

    async fn next_request(&mut self, completed: u64) -> Option<u64> {
        loop {
            let latest = self.latest_request();
            if latest > completed {
                return Some(latest);
            }
            self.requests.changed().await.ok()?;
        }
    }

    async fn run(mut self, shutdown: CancellationToken) {
        info!("Refresh coordinator started");
        let mut completed = 0;
        let mut last_start: Option<Instant> = None;

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => None,
                next = self.next_request(completed) => next,
            };
            if next.is_none() {
                break;
            }

            if let Some(last) = last_start {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep_until(last + self.settings.min_interval) => {}
                }
            }

            // Anything requested during the wait rides along
            let epoch = self.latest_request();
            last_start = Some(Instant::now());

            match self.run_cycle(epoch).await {
                Some(result) => {
                    completed = epoch;
                    self.finish(epoch, result);
                }
                None => debug!("Refresh {} superseded", epoch),
            }
        }

        info!("Refresh coordinator stopped");
    }

    /// `None` when a newer request took over mid-cycle
    async fn run_cycle(&self, epoch: u64) -> Option<RefreshOutcome> {
        info!("Refresh {} started", epoch);

        let cycle = RefreshCycle::begin(epoch, self.session.clone())
            .tear_down()
            .await;
        let cycle = match cycle.resolve(self.registry.as_ref()).await {
            Ok(cycle) => cycle,
            Err(e) => return Some(Err(e)),
        };
        if self.superseded(epoch) {
            cycle.abandon();
            return None;
        }

        let cycle = match cycle.connect(self.settings.options.clone()).await {
            Ok(cycle) => cycle,
            Err(e) => return Some(Err(e)),
        };
        let cycle = cycle.subscribe_all(self.settings.subscribe_qos).await;
        if self.superseded(epoch) {
            return None;
        }

        cycle.swap(&self.index).map(Ok)
    }

    fn finish(&self, epoch: u64, result: RefreshOutcome) {
        match &result {
            Ok(report) if report.is_complete() => {
                info!(
                    "Refresh {} done, {} topic(s) subscribed",
                    epoch,
                    report.subscribed.len()
                );
            }
            Ok(report) => warn!(
                "Refresh {} done with {} failed subscription(s)",
                epoch,
                report.failed.len()
            ),
            Err(e) => error!("Refresh {} failed: {}", epoch, e),
        }

        self.router.report_refresh(result.clone());
        self.outcomes
            .send_replace(Some(CompletedRefresh { epoch, result }));
    }
}
