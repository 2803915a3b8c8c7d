// Tip presence tracking with per-sensor debounce
//
// A background task follows every tip presence notification on the bus. A
// report only becomes the sensor's state once no newer report arrived for the
// debounce window; callbacks hear about settled changes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::bus::arbitration::NodeId;
use crate::bus::driver::BusError;
use crate::bus::messages::{MessageBody, MessageId};
use crate::bus::messenger::{filter_ids, BusMessenger, Incoming, Subscription};
use crate::error::{FaultDetail, MotionError, Result};

pub type SensorId = u8;

/// Settled state of one tip sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TipState {
    pub node: NodeId,
    pub sensor: SensorId,
    pub present: bool,
}

pub type TipCallback = Arc<dyn Fn(TipState) + Send + Sync>;

type Callbacks = Arc<Mutex<HashMap<u64, TipCallback>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Handle returned by `subscribe`; dropping it also unsubscribes
pub struct TipSubscription {
    id: u64,
    callbacks: Callbacks,
}

impl TipSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for TipSubscription {
    fn drop(&mut self) {
        lock(&self.callbacks).remove(&self.id);
    }
}

pub struct TipPresenceManager {
    messenger: Arc<BusMessenger>,
    callbacks: Callbacks,
    states: Arc<Mutex<BTreeMap<(NodeId, SensorId), bool>>>,
    next_id: AtomicU64,
    task: JoinHandle<()>,
}

impl TipPresenceManager {
    pub fn start(messenger: Arc<BusMessenger>, debounce: Duration) -> Self {
        let callbacks: Callbacks = Arc::new(Mutex::new(HashMap::new()));
        let states = Arc::new(Mutex::new(BTreeMap::new()));
        let notifications = messenger.subscribe(filter_ids(&[MessageId::TipPresenceNotification]));
        let task = tokio::spawn(debounce_loop(notifications, debounce, callbacks.clone(), states.clone()));
        info!("Tip presence manager started ({:?} debounce)", debounce);
        Self {
            messenger,
            callbacks,
            states,
            next_id: AtomicU64::new(0),
            task,
        }
    }

    /// Register a callback for settled state changes
    pub fn subscribe(&self, callback: impl Fn(TipState) + Send + Sync + 'static) -> TipSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.callbacks).insert(id, Arc::new(callback));
        TipSubscription {
            id,
            callbacks: self.callbacks.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.callbacks).len()
    }

    /// Last settled state of a sensor
    pub fn state(&self, node: NodeId, sensor: SensorId) -> Option<bool> {
        lock(&self.states).get(&(node, sensor)).copied()
    }

    /// Ask `node` for its tip sensors and wait until every expected one reports
    ///
    /// Answers are returned as reported, without debounce, one per sensor in
    /// sensor order. A later report from the same sensor replaces an earlier one.
    pub async fn poll(
        &self,
        node: NodeId,
        expected_sensors: &[SensorId],
        timeout: Duration,
    ) -> Result<Vec<TipState>> {
        let origins: BTreeSet<NodeId> = node.expand().iter().copied().collect();
        let mut reports = self
            .messenger
            .subscribe(filter_ids(&[MessageId::TipPresenceNotification]));
        self.messenger.send(node, MessageBody::TipStatusQuery).await?;

        let deadline = Instant::now() + timeout;
        let mut seen: BTreeMap<SensorId, TipState> = BTreeMap::new();
        while !expected_sensors.iter().all(|s| seen.contains_key(s)) {
            let incoming = match timeout_at(deadline, reports.recv()).await {
                Ok(Some(incoming)) => incoming,
                Ok(None) => return Err(MotionError::Bus(BusError::Closed)),
                Err(_) => {
                    let missing: Vec<String> = expected_sensors
                        .iter()
                        .filter(|s| !seen.contains_key(*s))
                        .map(|s| s.to_string())
                        .collect();
                    warn!("Tip status poll of {} missing sensors {:?}", node, missing);
                    return Err(MotionError::CommandTimedOut(
                        FaultDetail::new(Some(node)).with("missing_sensors", missing.join(",")),
                    ));
                }
            };
            let Some(origin) = incoming.origin().filter(|o| origins.contains(o)) else {
                continue;
            };
            if let MessageBody::TipPresenceNotification { present, sensor } = incoming.message.body {
                seen.insert(
                    sensor,
                    TipState {
                        node: origin,
                        sensor,
                        present,
                    },
                );
            }
        }
        Ok(seen.into_values().collect())
    }
}

impl Drop for TipPresenceManager {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn report(incoming: &Incoming) -> Option<((NodeId, SensorId), bool)> {
    match incoming.message.body {
        MessageBody::TipPresenceNotification { present, sensor } => {
            incoming.origin().map(|node| ((node, sensor), present))
        }
        _ => None,
    }
}

async fn debounce_loop(
    mut notifications: Subscription,
    debounce: Duration,
    callbacks: Callbacks,
    states: Arc<Mutex<BTreeMap<(NodeId, SensorId), bool>>>,
) {
    // Latest unsettled report per sensor and when it settles
    let mut pending: BTreeMap<(NodeId, SensorId), (bool, Instant)> = BTreeMap::new();

    loop {
        let next_settle = pending.values().map(|(_, at)| *at).min();
        tokio::select! {
            incoming = notifications.recv() => {
                let Some(incoming) = incoming else {
                    debug!("Tip presence subscription closed");
                    break;
                };
                if let Some((key, present)) = report(&incoming) {
                    pending.insert(key, (present, Instant::now() + debounce));
                }
            }
            _ = async {
                match next_settle {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                let now = Instant::now();
                let due: Vec<_> = pending
                    .iter()
                    .filter(|(_, (_, at))| *at <= now)
                    .map(|(key, (present, _))| (*key, *present))
                    .collect();
                for ((node, sensor), present) in due {
                    pending.remove(&(node, sensor));
                    let previous = lock(&states).insert((node, sensor), present);
                    if previous == Some(present) {
                        continue;
                    }
                    let state = TipState { node, sensor, present };
                    info!("Tip presence on {} sensor {}: {}", node, sensor, present);
                    let listeners: Vec<TipCallback> = lock(&callbacks).values().cloned().collect();
                    for callback in listeners {
                        callback(state);
                    }
                }
            }
        }
    }
}
