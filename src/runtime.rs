// Motion runtime: one bus connection, one move in flight at a time
//
// Owns the messenger and the background listeners, and guards execution so a
// second move (or a motor enable change) cannot start while one is running.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::bus::arbitration::NodeId;
use crate::bus::driver::{BusError, FrameReader, FrameWriter};
use crate::bus::loopback::{loopback, SimConfig, SimulatedNodes};
use crate::bus::messages::{MessageBody, MessageId};
use crate::bus::messenger::{BusMessenger, MessengerConfig};
use crate::bus::{serial, zenoh};
use crate::config::{Config, TransportConfig, SERIAL_TIMEOUT_MS};
use crate::error::{FaultDetail, MotionError, Result};
use crate::job::{PlanReport, PlanRequest, RunReport};
use crate::listeners::{MotorEnableControl, SensorId, TipPresenceManager, TipState, TipSubscription};
use crate::motion::encoder::MoveEncoder;
use crate::motion::steps::MoveGroups;
use crate::planning::{MoveManager, PlanError};
use crate::runner::{MoveFailure, MoveGroupRunner, RunOutcome, RunnerConfig, StopSignal};

/// Status word reported by a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatus {
    pub status: u8,
    pub data: u32,
}

/// Clears the in-flight flag when execution ends, however it ends
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn busy(action: &str) -> MotionError {
    MotionError::InteractionBusy(FaultDetail::default().with("action", action))
}

pub struct MotionRuntime {
    messenger: Arc<BusMessenger>,
    encoder: MoveEncoder,
    runner_config: RunnerConfig,
    stop: StopSignal,
    in_flight: AtomicBool,
    motors: MotorEnableControl,
    tips: TipPresenceManager,
}

impl MotionRuntime {
    pub fn new(messenger: Arc<BusMessenger>, config: &Config) -> Self {
        let motors = MotorEnableControl::start(messenger.clone(), config.ack_timeout());
        let tips = TipPresenceManager::start(messenger.clone(), config.tip_debounce());
        Self {
            messenger,
            encoder: MoveEncoder::default(),
            runner_config: RunnerConfig {
                min_group_timeout: config.min_group_timeout(),
                timeout_factor: config.group_timeout_factor,
            },
            stop: StopSignal::new(),
            in_flight: AtomicBool::new(false),
            motors,
            tips,
        }
    }

    pub fn with_encoder(mut self, encoder: MoveEncoder) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn messenger(&self) -> &Arc<BusMessenger> {
        &self.messenger
    }

    /// Handle that cancels whatever is executing
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Plan a request into move groups; the flag reports blending convergence
    pub fn plan(&self, request: &PlanRequest) -> std::result::Result<(bool, MoveGroups), PlanError> {
        let manager = MoveManager::new(request.constraints.clone())?;
        manager.plan_groups(request.origin, &request.targets, request.iteration_limit, &self.encoder)
    }

    /// Run move groups to completion, cancellation or the first fault
    pub async fn execute(&self, groups: MoveGroups) -> std::result::Result<RunOutcome, MoveFailure> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Execute requested while a move is in flight");
            return Err(MoveFailure {
                fault: busy("execute"),
                positions: BTreeMap::new(),
            });
        }
        let _guard = InFlight(&self.in_flight);

        let runner = MoveGroupRunner::new(groups, self.runner_config);
        info!(
            "Executing {} move groups ({:.3}s)",
            runner.groups().len(),
            runner.duration()
        );
        runner.run(&self.messenger, &self.stop).await
    }

    /// Cancel the current move (if any) and stop every node
    pub async fn stop(&self) -> Result<()> {
        info!("Stop requested");
        self.stop.stop();
        self.messenger.send(NodeId::Broadcast, MessageBody::Stop).await?;
        Ok(())
    }

    pub async fn enable(&self, nodes: &[NodeId]) -> Result<()> {
        if self.is_busy() {
            return Err(busy("enable"));
        }
        self.motors.enable(nodes).await
    }

    pub async fn disable(&self, nodes: &[NodeId]) -> Result<()> {
        if self.is_busy() {
            return Err(busy("disable"));
        }
        self.motors.disable(nodes).await
    }

    pub async fn motor_enabled(&self, nodes: &[NodeId], timeout: Duration) -> Result<BTreeMap<NodeId, bool>> {
        self.motors.query(nodes, timeout).await
    }

    pub fn subscribe_tip_presence(&self, callback: impl Fn(TipState) + Send + Sync + 'static) -> TipSubscription {
        self.tips.subscribe(callback)
    }

    pub async fn poll_tip_presence(
        &self,
        node: NodeId,
        expected_sensors: &[SensorId],
        timeout: Duration,
    ) -> Result<Vec<TipState>> {
        self.tips.poll(node, expected_sensors, timeout).await
    }

    /// Status words of the nodes that answered within `timeout`
    pub async fn node_status(&self, nodes: &[NodeId], timeout: Duration) -> Result<BTreeMap<NodeId, NodeStatus>> {
        let answers = self
            .messenger
            .request(
                NodeId::Broadcast,
                MessageBody::GetStatusRequest,
                MessageId::GetStatusResponse,
                nodes,
                timeout,
            )
            .await?;
        Ok(answers
            .into_iter()
            .filter_map(|(node, incoming)| match incoming.message.body {
                MessageBody::GetStatusResponse { status, data } => Some((node, NodeStatus { status, data })),
                _ => None,
            })
            .collect())
    }
}

/// A connected bus; `simulator` is set for the loopback transport
pub struct BusConnection {
    pub messenger: Arc<BusMessenger>,
    pub simulator: Option<SimulatedNodes>,
}

/// Open the configured transport and start a messenger on it
pub async fn connect(config: &Config) -> std::result::Result<BusConnection, BusError> {
    let messenger_config = MessengerConfig {
        send_retries: config.send_retries,
        retry_backoff: config.retry_backoff(),
    };

    let mut simulator = None;
    let (writer, reader): (Arc<dyn FrameWriter>, Box<dyn FrameReader>) = match &config.transport {
        TransportConfig::Loopback => {
            info!("Using simulated nodes on a loopback bus");
            let (writer, reader, peer) = loopback();
            simulator = Some(SimulatedNodes::spawn(peer, SimConfig::default()));
            (Arc::new(writer) as Arc<dyn FrameWriter>, Box::new(reader) as Box<dyn FrameReader>)
        }
        TransportConfig::Serial { port, baudrate } => {
            let (writer, reader) = serial::open(port, *baudrate, Duration::from_millis(SERIAL_TIMEOUT_MS))?;
            (Arc::new(writer) as Arc<dyn FrameWriter>, Box::new(reader) as Box<dyn FrameReader>)
        }
        TransportConfig::Zenoh { tx_key, rx_key } => {
            let (writer, reader) = zenoh::open(tx_key, rx_key).await?;
            (Arc::new(writer) as Arc<dyn FrameWriter>, Box::new(reader) as Box<dyn FrameReader>)
        }
    };

    Ok(BusConnection {
        messenger: Arc::new(BusMessenger::start(writer, reader, messenger_config)),
        simulator,
    })
}

fn load_request(path: &Path) -> std::result::Result<PlanRequest, Box<dyn std::error::Error + Send + Sync>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Plan a request file and print the groups as JSON
pub fn plan_file(request: &Path) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let request = load_request(request)?;
    let manager = MoveManager::new(request.constraints.clone())?;
    let (converged, groups) =
        manager.plan_groups(request.origin, &request.targets, request.iteration_limit, &MoveEncoder::default())?;
    info!("Planned {} move groups (converged: {})", groups.len(), converged);
    println!("{}", serde_json::to_string_pretty(&PlanReport::new(converged, groups))?);
    Ok(())
}

/// Plan a request file, execute it on the configured bus and print final positions
pub async fn run(
    request: &Path,
    config: Option<&Path>,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = match config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let request = load_request(request)?;

    let connection = connect(&config).await?;
    let runtime = MotionRuntime::new(connection.messenger.clone(), &config);
    let (converged, groups) = runtime.plan(&request)?;

    let nodes: Vec<NodeId> = groups
        .iter()
        .flat_map(|g| g.nodes())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    runtime.enable(&nodes).await?;

    let outcome = tokio::select! {
        outcome = runtime.execute(groups) => outcome?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping motion");
            runtime.stop().await?;
            return Ok(());
        }
    };

    println!("{}", serde_json::to_string_pretty(&RunReport::new(converged, outcome))?);
    connection.messenger.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::steps::{MoveGroup, MoveStep, MoveStopCondition};

    async fn loopback_runtime() -> (MotionRuntime, BusConnection) {
        let config = Config::default();
        let connection = connect(&config).await.unwrap();
        (MotionRuntime::new(connection.messenger.clone(), &config), connection)
    }

    fn slow_group() -> MoveGroups {
        vec![MoveGroup::new(vec![BTreeMap::from([(
            NodeId::GantryX,
            MoveStep::Linear {
                distance: 20.0,
                velocity: 10.0,
                acceleration: 0.0,
                duration: 2.0,
                stop_condition: MoveStopCondition::empty(),
            },
        )])])]
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_interaction_is_busy() {
        let (runtime, _connection) = loopback_runtime().await;

        let (first, second, enable) = tokio::join!(runtime.execute(slow_group()), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            runtime.execute(slow_group()).await
        }, async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            runtime.enable(&[NodeId::GantryY]).await
        });

        assert!(matches!(first, Ok(RunOutcome::Completed(_))));
        assert!(matches!(second.unwrap_err().fault, MotionError::InteractionBusy(_)));
        assert!(matches!(enable, Err(MotionError::InteractionBusy(_))));
        assert!(!runtime.is_busy());
        assert!(runtime.enable(&[NodeId::GantryY]).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_execution() {
        let (runtime, connection) = loopback_runtime().await;

        let (outcome, stopped) = tokio::join!(runtime.execute(slow_group()), async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            runtime.stop().await
        });
        assert!(stopped.is_ok());
        assert!(matches!(outcome, Ok(RunOutcome::Cancelled(_))));

        let simulator = connection.simulator.as_ref().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        // cancelled half way through a 20 mm move that never reported back
        assert_eq!(simulator.position(NodeId::GantryX), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_status_from_simulator() {
        let (runtime, _connection) = loopback_runtime().await;
        runtime.enable(&[NodeId::GantryX]).await.unwrap();
        let status = runtime
            .node_status(&[NodeId::GantryX, NodeId::GantryY], Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(status[&NodeId::GantryX].status, 1);
        assert_eq!(status[&NodeId::GantryY].status, 0);
    }
}
