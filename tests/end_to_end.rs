// Plan -> encode -> execute against simulated nodes on a loopback bus

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gantry_motion::bus::arbitration::ArbitrationId;
use gantry_motion::bus::driver::{BusError, BusFrame, FrameWriter};
use gantry_motion::bus::loopback::{loopback, LoopbackWriter, Received, SimConfig, SimulatedNodes};
use gantry_motion::bus::messages::{ErrorCode, ErrorSeverity, MessageBody, MessageId};
use gantry_motion::bus::messenger::{BusMessenger, MessengerConfig};
use gantry_motion::bus::NodeId;
use gantry_motion::motion::encoder::MoveEncoder;
use gantry_motion::motion::steps::{MoveGroup, MoveStep, MoveStopCondition};
use gantry_motion::planning::{Axis, AxisConstraints, Coordinates, MoveManager, MoveTarget, SystemConstraints};
use gantry_motion::runner::{MoveGroupRunner, RunOutcome, RunnerConfig, StopSignal};
use gantry_motion::MotionError;
use tokio::time::Instant;

fn constraints(accel: f64, speed_dc: f64, dir_dc: f64) -> SystemConstraints {
    [Axis::X, Axis::Y]
        .into_iter()
        .map(|axis| (axis, AxisConstraints::new(accel, speed_dc, dir_dc)))
        .collect()
}

fn xy(x: f64, y: f64) -> Coordinates {
    Coordinates::from_pairs([(Axis::X, x), (Axis::Y, y)])
}

/// Rest-to-rest trapezoid allowed to start and end at `v0`
fn trapezoid_time(distance: f64, v0: f64, vmax: f64, accel: f64) -> f64 {
    let ramp = (vmax * vmax - v0 * v0) / (2.0 * accel);
    if 2.0 * ramp <= distance {
        2.0 * (vmax - v0) / accel + (distance - 2.0 * ramp) / vmax
    } else {
        let peak = (v0 * v0 + accel * distance).sqrt();
        2.0 * (peak - v0) / accel
    }
}

fn start(config: SimConfig) -> (BusMessenger, SimulatedNodes) {
    let (writer, reader, peer) = loopback();
    let messenger = BusMessenger::start(Arc::new(writer), Box::new(reader), MessengerConfig::default());
    (messenger, SimulatedNodes::spawn(peer, config))
}

fn linear(distance: f64, duration: f64) -> MoveStep {
    MoveStep::Linear {
        distance,
        velocity: distance / duration,
        acceleration: 0.0,
        duration,
        stop_condition: MoveStopCondition::empty(),
    }
}

#[test]
fn test_single_axis_leg_excludes_idle_axis() {
    let manager = MoveManager::new(constraints(1000.0, 100.0, 10.0)).unwrap();
    let (converged, moves) = manager
        .plan(xy(0.0, 0.0), &[MoveTarget::new(xy(100.0, 0.0), 100.0)], 20)
        .unwrap();
    assert!(converged);
    assert_eq!(moves.len(), 1);

    for index in 0..3 {
        assert_eq!(moves[0].axis_block(Axis::Y, index).distance, 0.0);
    }
    let expected = trapezoid_time(100.0, 100.0, 100.0, 1000.0);
    assert!((moves[0].duration() - expected).abs() < 1e-6);

    let groups = MoveEncoder::default().encode_moves(&moves).unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].nodes(), BTreeSet::from([NodeId::GantryX]));
}

#[test]
fn test_trapezoid_duration_from_rest() {
    let manager = MoveManager::new(constraints(1000.0, 10.0, 5.0)).unwrap();
    let (converged, moves) = manager
        .plan(xy(0.0, 0.0), &[MoveTarget::new(xy(100.0, 0.0), 100.0)], 20)
        .unwrap();
    assert!(converged);
    let expected = trapezoid_time(100.0, 10.0, 100.0, 1000.0);
    assert!((moves[0].duration() - expected).abs() < 1e-6, "{} vs {}", moves[0].duration(), expected);
}

#[tokio::test(start_paused = true)]
async fn test_planned_moves_reach_their_targets() {
    let (messenger, sim) = start(SimConfig::default());
    let manager = MoveManager::new(constraints(1000.0, 10.0, 5.0)).unwrap();
    let targets = [
        MoveTarget::new(xy(100.0, 0.0), 100.0),
        MoveTarget::new(xy(100.0, 40.0), 80.0),
        MoveTarget::new(xy(60.0, 40.0), 80.0),
    ];
    let (converged, groups) = manager
        .plan_groups(xy(0.0, 0.0), &targets, 20, &MoveEncoder::default())
        .unwrap();
    assert!(converged);
    assert_eq!(groups.len(), 3);

    let runner = MoveGroupRunner::new(groups, RunnerConfig::default());
    let outcome = runner.run(&messenger, &StopSignal::new()).await.unwrap();
    let RunOutcome::Completed(positions) = outcome else {
        panic!("expected completion");
    };
    assert!((positions[&NodeId::GantryX].motor_mm - 60.0).abs() < 0.05);
    assert!((positions[&NodeId::GantryY].motor_mm - 40.0).abs() < 0.05);
    assert!((sim.position(NodeId::GantryX) - 60.0).abs() < 0.05);
}

#[tokio::test(start_paused = true)]
async fn test_execute_follows_every_step_request() {
    let (messenger, sim) = start(SimConfig::default());
    let groups = vec![
        MoveGroup::new(vec![
            BTreeMap::from([(NodeId::GantryX, linear(5.0, 0.2)), (NodeId::GantryY, linear(5.0, 0.2))]),
            BTreeMap::from([(NodeId::Head, linear(2.0, 0.1))]),
        ]),
        MoveGroup::new(vec![BTreeMap::from([(NodeId::GantryY, linear(-5.0, 0.2))])]),
    ];
    let runner = MoveGroupRunner::new(groups, RunnerConfig::default());
    assert!(runner.run(&messenger, &StopSignal::new()).await.is_ok());

    let received: Vec<Received> = sim.received();
    let executes: Vec<usize> = received
        .iter()
        .enumerate()
        .filter(|(_, r)| matches!(r.message.body, MessageBody::ExecuteMoveGroup(_)))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(executes.len(), 2);

    for (group, &at) in executes.iter().enumerate() {
        let MessageBody::ExecuteMoveGroup(execute) = received[at].message.body else {
            unreachable!();
        };
        assert_eq!(execute.group_id as usize, group);
        assert_eq!(received[at].destination, NodeId::Broadcast as u8);

        // Every step request of this group arrived before its trigger
        let requests_after = received[at..]
            .iter()
            .filter_map(|r| r.message.body.step_id())
            .filter(|(g, _)| *g as usize == group)
            .count();
        assert_eq!(requests_after, 0);
    }

    let first_group_requests = received[..executes[0]]
        .iter()
        .filter(|r| r.message.body.step_id().is_some())
        .count();
    assert_eq!(first_group_requests, 3);
    assert_eq!(received[0].message.body, MessageBody::ClearAllMoveGroups);
}

#[tokio::test(start_paused = true)]
async fn test_silent_node_times_out_after_deadline() {
    let config = SimConfig {
        unresponsive: BTreeSet::from([NodeId::GantryY]),
        ..SimConfig::default()
    };
    let (messenger, _sim) = start(config);
    let groups = vec![MoveGroup::new(vec![BTreeMap::from([
        (NodeId::GantryX, linear(10.0, 1.0)),
        (NodeId::GantryY, linear(10.0, 1.0)),
    ])])];
    let runner_config = RunnerConfig::default();
    let timeout = runner_config.group_timeout(1.0);
    let runner = MoveGroupRunner::new(groups, runner_config);

    let started = Instant::now();
    let failure = runner.run(&messenger, &StopSignal::new()).await.unwrap_err();
    let elapsed = started.elapsed();

    let MotionError::CommandTimedOut(detail) = &failure.fault else {
        panic!("expected timeout, got {:?}", failure.fault);
    };
    assert_eq!(detail.context["missing_nodes"], "gantry_y");
    assert!(elapsed >= timeout, "gave up after {:?}", elapsed);
    assert!(elapsed < timeout + Duration::from_millis(100));
    // gantry_x finished before the deadline and its position survives
    assert!(failure.positions.contains_key(&NodeId::GantryX));
}

#[tokio::test(start_paused = true)]
async fn test_overpressure_fails_without_waiting() {
    let config = SimConfig {
        faults: BTreeMap::from([(NodeId::HeadL, (ErrorCode::OverPressure, ErrorSeverity::Recoverable))]),
        ..SimConfig::default()
    };
    let (messenger, sim) = start(config);
    let groups = vec![MoveGroup::new(vec![BTreeMap::from([
        (NodeId::GantryX, linear(50.0, 5.0)),
        (NodeId::HeadL, linear(20.0, 5.0)),
        (NodeId::HeadR, linear(20.0, 5.0)),
    ])])];
    let runner = MoveGroupRunner::new(groups, RunnerConfig::default());

    let started = Instant::now();
    let failure = runner.run(&messenger, &StopSignal::new()).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(1));

    let MotionError::PipetteOverpressure(detail) = &failure.fault else {
        panic!("expected overpressure, got {:?}", failure.fault);
    };
    assert_eq!(detail.node, Some(NodeId::HeadL));
    assert_eq!(detail.code, Some(ErrorCode::OverPressure as u16));
    assert_eq!(detail.code_name().as_deref(), Some("over_pressure"));
    assert!(failure.positions.is_empty());

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(sim.received().iter().any(|r| r.message.body == MessageBody::Stop));
}

/// Calls `stop` while the host is writing the `nth` frame carrying `message_id`
struct StopOnWrite {
    inner: LoopbackWriter,
    stop: StopSignal,
    message_id: MessageId,
    nth: u32,
    seen: AtomicU32,
}

#[async_trait]
impl FrameWriter for StopOnWrite {
    async fn write(&self, frame: &BusFrame) -> Result<(), BusError> {
        if ArbitrationId::unpack(frame.arbitration_id).message_id == self.message_id as u16
            && self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.nth
        {
            self.stop.stop();
        }
        self.inner.write(frame).await
    }
}

fn start_stopping_on(message_id: MessageId, nth: u32, stop: &StopSignal) -> (BusMessenger, SimulatedNodes) {
    let (writer, reader, peer) = loopback();
    let writer = StopOnWrite {
        inner: writer,
        stop: stop.clone(),
        message_id,
        nth,
        seen: AtomicU32::new(0),
    };
    let messenger = BusMessenger::start(Arc::new(writer), Box::new(reader), MessengerConfig::default());
    (messenger, SimulatedNodes::spawn(peer, SimConfig::default()))
}

fn executed_groups(sim: &SimulatedNodes) -> Vec<u8> {
    sim.received()
        .iter()
        .filter_map(|r| match r.message.body {
            MessageBody::ExecuteMoveGroup(execute) => Some(execute.group_id),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_loading_never_triggers() {
    let stop = StopSignal::new();
    let (messenger, sim) = start_stopping_on(MessageId::AddLinearMove, 1, &stop);
    let groups = vec![MoveGroup::new(vec![BTreeMap::from([(NodeId::GantryX, linear(10.0, 1.0))])])];
    let runner = MoveGroupRunner::new(groups, RunnerConfig::default());

    let outcome = runner.run(&messenger, &stop).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Cancelled(ref p) if p.is_empty()));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(executed_groups(&sim).is_empty());
    assert!(sim.received().iter().any(|r| r.message.body == MessageBody::Stop));
    assert_eq!(sim.position(NodeId::GantryX), 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_between_groups_skips_the_rest() {
    let stop = StopSignal::new();
    // The second clear opens group 1, after group 0 has completed
    let (messenger, sim) = start_stopping_on(MessageId::ClearAllMoveGroups, 2, &stop);
    let groups = vec![
        MoveGroup::new(vec![BTreeMap::from([(NodeId::GantryX, linear(10.0, 0.5))])]),
        MoveGroup::new(vec![BTreeMap::from([(NodeId::GantryX, linear(10.0, 0.5))])]),
    ];
    let runner = MoveGroupRunner::new(groups, RunnerConfig::default());

    let outcome = runner.run(&messenger, &stop).await.unwrap();
    let RunOutcome::Cancelled(positions) = outcome else {
        panic!("expected cancellation");
    };
    assert!((positions[&NodeId::GantryX].motor_mm - 10.0).abs() < 0.01);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(executed_groups(&sim), vec![0]);
    assert!((sim.position(NodeId::GantryX) - 10.0).abs() < 0.01);
}

#[tokio::test(start_paused = true)]
async fn test_stop_mid_move_broadcasts_stop() {
    let (messenger, sim) = start(SimConfig::default());
    let groups = vec![
        MoveGroup::new(vec![
            BTreeMap::from([(NodeId::GantryY, linear(5.0, 0.5))]),
            BTreeMap::from([(NodeId::GantryY, linear(50.0, 5.0))]),
        ]),
        MoveGroup::new(vec![BTreeMap::from([(NodeId::GantryX, linear(10.0, 1.0))])]),
    ];
    let runner = MoveGroupRunner::new(groups, RunnerConfig::default());
    let stop = StopSignal::new();

    let canceller = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        canceller.stop();
    });
    let started = Instant::now();
    let outcome = runner.run(&messenger, &stop).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));

    // the first step finished and reported; the second was cut short
    let RunOutcome::Cancelled(positions) = outcome else {
        panic!("expected cancellation");
    };
    assert!((positions[&NodeId::GantryY].motor_mm - 5.0).abs() < 0.01);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(sim.received().iter().any(|r| r.message.body == MessageBody::Stop));
    assert_eq!(executed_groups(&sim), vec![0]);
    assert!((sim.position(NodeId::GantryY) - 5.0).abs() < 0.01);
}
