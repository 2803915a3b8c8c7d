// Bus messenger: one reader task fanning frames out to filtered subscriptions
//
// Every subscription gets its own unbounded queue and its own copy of each
// matching message. Sends go through a shared writer with bounded retry of
// transient failures.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use super::arbitration::{expand_nodes, ArbitrationId, FunctionCode, NodeId};
use super::driver::{BusError, BusFrame, FrameReader, FrameWriter};
use super::messages::{ErrorMessage, Message, MessageBody, MessageId};
use crate::config::{DEFAULT_RETRY_BACKOFF, DEFAULT_SEND_RETRIES, MIN_ACK_TIMEOUT};

/// Nodes expected to answer a broadcast when the caller names none
const BASIC_NODES: [NodeId; 3] = [NodeId::GantryX, NodeId::GantryY, NodeId::Head];

/// A decoded message together with its addressing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Incoming {
    pub arbitration_id: ArbitrationId,
    pub message: Message,
}

impl Incoming {
    pub fn origin(&self) -> Option<NodeId> {
        self.arbitration_id.origin()
    }

    pub fn message_id(&self) -> MessageId {
        self.message.message_id()
    }
}

/// Decides which incoming messages a subscription receives
pub type MessageFilter = Arc<dyn Fn(&Incoming) -> bool + Send + Sync>;

/// Accept only the listed message ids
pub fn filter_ids(ids: &[MessageId]) -> MessageFilter {
    let ids: Vec<MessageId> = ids.to_vec();
    Arc::new(move |incoming: &Incoming| ids.contains(&incoming.message_id()))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MessengerConfig {
    /// Extra attempts after a transient write failure
    pub send_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            send_retries: DEFAULT_SEND_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

/// Result of a send that waits for acknowledgements
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Acknowledged,
    /// At least one node answered with an error message
    Rejected {
        node: Option<NodeId>,
        error: ErrorMessage,
    },
    TimedOut {
        missing: BTreeSet<NodeId>,
    },
}

struct Listener {
    filter: MessageFilter,
    tx: mpsc::UnboundedSender<Incoming>,
}

#[derive(Default)]
struct Registry {
    listeners: Mutex<HashMap<u64, Listener>>,
    next_id: AtomicU64,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Listener>> {
        // A panicking listener filter must not take the bus down with it
        match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Hand a message to every matching listener; false if nobody wanted it
    fn dispatch(&self, incoming: &Incoming) -> bool {
        let mut handled = false;
        let mut listeners = self.lock();
        listeners.retain(|_, listener| {
            if !(listener.filter)(incoming) {
                return true;
            }
            handled = true;
            listener.tx.send(*incoming).is_ok()
        });
        handled
    }
}

/// Handle on a filtered stream of incoming messages
///
/// Unregisters itself when dropped.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Incoming>,
    registry: Arc<Registry>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Incoming> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Incoming> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.id);
    }
}

pub struct BusMessenger {
    writer: Arc<dyn FrameWriter>,
    registry: Arc<Registry>,
    message_index: AtomicU32,
    config: MessengerConfig,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl BusMessenger {
    /// Start the reader task and return a messenger sending through `writer`
    pub fn start(
        writer: Arc<dyn FrameWriter>,
        reader: Box<dyn FrameReader>,
        config: MessengerConfig,
    ) -> Self {
        let registry = Arc::new(Registry::default());
        let task = tokio::spawn(read_loop(reader, registry.clone()));
        info!(
            "Bus messenger started ({} send retries, {:?} backoff)",
            config.send_retries, config.retry_backoff
        );
        Self {
            writer,
            registry,
            message_index: AtomicU32::new(1),
            config,
            reader_task: Mutex::new(Some(task)),
        }
    }

    pub fn subscribe(&self, filter: MessageFilter) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.lock().insert(id, Listener { filter, tx });
        Subscription {
            id,
            rx,
            registry: self.registry.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().len()
    }

    fn next_index(&self) -> u32 {
        self.message_index.fetch_add(1, Ordering::Relaxed)
    }

    fn frame(node: NodeId, message: &Message) -> Result<BusFrame, BusError> {
        let function = if message.message_id() == MessageId::Error {
            FunctionCode::Error
        } else {
            FunctionCode::NetworkManagement
        };
        let arbitration_id = ArbitrationId::from_host(node, function, message.message_id() as u16);
        Ok(BusFrame::new(arbitration_id.pack(), message.encode()?))
    }

    /// Send with retry of transient failures; returns the message index used
    pub async fn send(&self, node: NodeId, body: MessageBody) -> Result<u32, BusError> {
        let message = Message::new(self.next_index(), body);
        let frame = Self::frame(node, &message)?;
        debug!("Sending --> {} {:?}", node, message);

        let mut attempt = 0;
        loop {
            match self.writer.write(&frame).await {
                Ok(()) => return Ok(message.index),
                Err(e) if e.is_transient() && attempt < self.config.send_retries => {
                    attempt += 1;
                    warn!(
                        "Transient send failure to {} ({}), retry {}/{}",
                        node, e, attempt, self.config.send_retries
                    );
                    sleep(self.config.retry_backoff).await;
                }
                Err(e) => {
                    error!("Send to {} failed: {}", node, e);
                    return Err(e);
                }
            }
        }
    }

    /// Send exactly one frame, no retry
    pub async fn send_once(&self, node: NodeId, body: MessageBody) -> Result<u32, BusError> {
        let message = Message::new(self.next_index(), body);
        let frame = Self::frame(node, &message)?;
        debug!("Sending once --> {} {:?}", node, message);
        self.writer.write(&frame).await?;
        Ok(message.index)
    }

    /// Send and wait until every expected node acknowledged (or errored)
    ///
    /// An empty `expected` means the destination itself, or the basic gantry
    /// nodes for a broadcast. Virtual nodes are satisfied by their members.
    pub async fn ensure_send(
        &self,
        node: NodeId,
        body: MessageBody,
        expected: &[NodeId],
        timeout: Duration,
    ) -> Result<AckOutcome, BusError> {
        let expected: Vec<NodeId> = if !expected.is_empty() {
            expected.to_vec()
        } else if node == NodeId::Broadcast {
            BASIC_NODES.to_vec()
        } else {
            vec![node]
        };
        let mut missing = expand_nodes(expected);

        let mut acks = self.subscribe(filter_ids(&[MessageId::Acknowledgement, MessageId::Error]));
        let index = self.send(node, body).await?;
        let deadline = Instant::now() + timeout.max(MIN_ACK_TIMEOUT);
        let mut rejected: Option<(Option<NodeId>, ErrorMessage)> = None;

        while !missing.is_empty() {
            let incoming = match timeout_at(deadline, acks.recv()).await {
                Ok(Some(incoming)) => incoming,
                Ok(None) => return Err(BusError::Closed),
                Err(_) => break,
            };
            if incoming.message.index != index {
                continue;
            }
            let origin = incoming.origin();
            if let Some(origin) = origin {
                missing.remove(&origin);
            }
            if let MessageBody::Error(error) = incoming.message.body {
                rejected.get_or_insert((origin, error));
            }
        }

        if let Some((node, error)) = rejected {
            return Ok(AckOutcome::Rejected { node, error });
        }
        if !missing.is_empty() {
            error!("Message {} not acknowledged by {:?}", index, missing);
            return Ok(AckOutcome::TimedOut { missing });
        }
        Ok(AckOutcome::Acknowledged)
    }

    /// Send a request and collect one `response` per expected node until the deadline
    ///
    /// Nodes that did not answer are absent from the result; later answers
    /// from the same node replace earlier ones.
    pub async fn request(
        &self,
        node: NodeId,
        body: MessageBody,
        response: MessageId,
        expected: &[NodeId],
        timeout: Duration,
    ) -> Result<BTreeMap<NodeId, Incoming>, BusError> {
        let expected = expand_nodes(expected.iter().copied());
        let mut responses = self.subscribe(filter_ids(&[response]));
        self.send(node, body).await?;

        let deadline = Instant::now() + timeout;
        let mut answers = BTreeMap::new();
        while answers.len() < expected.len() {
            match timeout_at(deadline, responses.recv()).await {
                Ok(Some(incoming)) => {
                    if let Some(origin) = incoming.origin().filter(|o| expected.contains(o)) {
                        answers.insert(origin, incoming);
                    }
                }
                Ok(None) => return Err(BusError::Closed),
                Err(_) => break,
            }
        }
        Ok(answers)
    }

    /// Stop the reader task; subscriptions see their queues close
    pub fn shutdown(&self) {
        let task = match self.reader_task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
            info!("Bus messenger stopped");
        }
        self.registry.lock().clear();
    }
}

impl Drop for BusMessenger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn read_loop(mut reader: Box<dyn FrameReader>, registry: Arc<Registry>) {
    loop {
        let frame = match reader.read().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("Bus reader closed");
                break;
            }
            Err(e) if e.is_transient() => {
                debug!("Transient read failure: {}", e);
                continue;
            }
            Err(e) => {
                error!("Bus reader failed: {}", e);
                break;
            }
        };

        let arbitration_id = ArbitrationId::unpack(frame.arbitration_id);
        let message = match Message::decode(arbitration_id.message_id, &frame.data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping frame from 0x{:02X}: {}", arbitration_id.originating_node_id, e);
                continue;
            }
        };
        let incoming = Incoming {
            arbitration_id,
            message,
        };
        debug!("Received <-- {:?} {:?}", incoming.origin(), message);

        if !registry.dispatch(&incoming) {
            if incoming.message_id() == MessageId::Error {
                error!("Asynchronous error message ignored: {:?}", incoming);
            } else {
                debug!("Message ignored: {:?}", incoming.message_id());
            }
        }
    }
    // Closing every queue lets waiting subscribers see the end of the bus
    registry.lock().clear();
}
