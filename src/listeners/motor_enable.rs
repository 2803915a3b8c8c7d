// Motor enable/disable requests and the host's view of which motors are on

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::arbitration::{expand_nodes, NodeId};
use crate::bus::messages::{MessageBody, MessageId};
use crate::bus::messenger::{filter_ids, AckOutcome, BusMessenger, Subscription};
use crate::error::{translate, FaultDetail, MotionError, Result};

type EnabledSet = Arc<Mutex<BTreeSet<NodeId>>>;

fn lock(set: &EnabledSet) -> MutexGuard<'_, BTreeSet<NodeId>> {
    match set.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct MotorEnableControl {
    messenger: Arc<BusMessenger>,
    enabled: EnabledSet,
    ack_timeout: Duration,
    task: JoinHandle<()>,
}

impl MotorEnableControl {
    pub fn start(messenger: Arc<BusMessenger>, ack_timeout: Duration) -> Self {
        let enabled: EnabledSet = Arc::new(Mutex::new(BTreeSet::new()));
        let responses = messenger.subscribe(filter_ids(&[MessageId::GetMotorEnabledResponse]));
        let task = tokio::spawn(track_responses(responses, enabled.clone()));
        Self {
            messenger,
            enabled,
            ack_timeout,
            task,
        }
    }

    /// Motors the host believes are enabled
    pub fn enabled(&self) -> BTreeSet<NodeId> {
        lock(&self.enabled).clone()
    }

    pub async fn enable(&self, nodes: &[NodeId]) -> Result<()> {
        self.set(nodes, true).await
    }

    pub async fn disable(&self, nodes: &[NodeId]) -> Result<()> {
        self.set(nodes, false).await
    }

    async fn set(&self, nodes: &[NodeId], enable: bool) -> Result<()> {
        let body = if enable {
            MessageBody::EnableMotor
        } else {
            MessageBody::DisableMotor
        };
        for &node in nodes {
            let outcome = self
                .messenger
                .ensure_send(node, body, &[], self.ack_timeout)
                .await?;
            match outcome {
                AckOutcome::Acknowledged => {}
                AckOutcome::Rejected { node: origin, error } => {
                    let context = BTreeMap::from([("request".to_string(), format!("{:?}", body))]);
                    if let Some(fault) = translate(origin, error.error_code, error.severity, context) {
                        return Err(fault);
                    }
                    warn!("Warning from {:?} while setting motor enable", origin);
                }
                AckOutcome::TimedOut { missing } => {
                    let names: Vec<String> = missing.iter().map(NodeId::to_string).collect();
                    return Err(MotionError::CommandTimedOut(
                        FaultDetail::new(Some(node))
                            .with("request", format!("{:?}", body))
                            .with("missing_nodes", names.join(",")),
                    ));
                }
            }

            let physical = expand_nodes([node]);
            let mut enabled = lock(&self.enabled);
            if enable {
                enabled.extend(physical);
            } else {
                enabled.retain(|n| !physical.contains(n));
            }
        }
        info!("Motors {} on {:?}", if enable { "enabled" } else { "disabled" }, nodes);
        Ok(())
    }

    /// Ask each node whether its motor is enabled; nodes that stay silent are left out
    pub async fn query(&self, nodes: &[NodeId], timeout: Duration) -> Result<BTreeMap<NodeId, bool>> {
        let answers = self
            .messenger
            .request(
                NodeId::Broadcast,
                MessageBody::GetMotorEnabledRequest,
                MessageId::GetMotorEnabledResponse,
                nodes,
                timeout,
            )
            .await?;

        let states: BTreeMap<NodeId, bool> = answers
            .into_iter()
            .filter_map(|(node, incoming)| match incoming.message.body {
                MessageBody::GetMotorEnabledResponse { enabled } => Some((node, enabled)),
                _ => None,
            })
            .collect();
        let missing: Vec<NodeId> = expand_nodes(nodes.iter().copied())
            .into_iter()
            .filter(|n| !states.contains_key(n))
            .collect();
        if !missing.is_empty() {
            warn!("No motor enabled response from {:?}", missing);
        }
        Ok(states)
    }
}

impl Drop for MotorEnableControl {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn track_responses(mut responses: Subscription, enabled: EnabledSet) {
    while let Some(incoming) = responses.recv().await {
        let (Some(node), MessageBody::GetMotorEnabledResponse { enabled: on }) =
            (incoming.origin(), incoming.message.body)
        else {
            continue;
        };
        debug!("{} reports motor enabled = {}", node, on);
        let mut set = lock(&enabled);
        if on {
            set.insert(node);
        } else {
            set.remove(&node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::loopback::{loopback, SimConfig, SimulatedNodes};
    use crate::bus::messenger::MessengerConfig;

    fn setup(config: SimConfig) -> (MotorEnableControl, SimulatedNodes) {
        let (writer, reader, peer) = loopback();
        let messenger = Arc::new(BusMessenger::start(
            Arc::new(writer),
            Box::new(reader),
            MessengerConfig::default(),
        ));
        let sim = SimulatedNodes::spawn(peer, config);
        (MotorEnableControl::start(messenger, Duration::from_secs(1)), sim)
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_then_query() {
        let (control, sim) = setup(SimConfig::default());
        control.enable(&[NodeId::GantryX, NodeId::Head]).await.unwrap();
        assert_eq!(
            control.enabled(),
            BTreeSet::from([NodeId::GantryX, NodeId::HeadL, NodeId::HeadR])
        );
        assert_eq!(sim.enabled(), control.enabled());

        let states = control
            .query(&[NodeId::GantryX, NodeId::GantryY], Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(
            states,
            BTreeMap::from([(NodeId::GantryX, true), (NodeId::GantryY, false)])
        );

        control.disable(&[NodeId::Head]).await.unwrap();
        assert_eq!(control.enabled(), BTreeSet::from([NodeId::GantryX]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_node_times_out() {
        let config = SimConfig {
            unresponsive: BTreeSet::from([NodeId::GantryY]),
            ..SimConfig::default()
        };
        let (control, _sim) = setup(config);
        let err = control.enable(&[NodeId::GantryY]).await.unwrap_err();
        let MotionError::CommandTimedOut(detail) = err else {
            panic!("expected timeout, got {:?}", err);
        };
        assert_eq!(detail.context["missing_nodes"], "gantry_y");
        assert!(control.enabled().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsolicited_responses_update_the_set() {
        let (control, _sim) = setup(SimConfig::default());
        control
            .query(&[NodeId::PipetteLeft], Duration::from_millis(100))
            .await
            .unwrap();
        assert!(control.enabled().is_empty());
        control.enable(&[NodeId::PipetteLeft]).await.unwrap();
        control
            .query(&[NodeId::PipetteLeft], Duration::from_millis(100))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(control.enabled().contains(&NodeId::PipetteLeft));
    }
}
