//! End-to-end runs: sequence actor, stream links and both device simulators
//! connected over in-memory pipes, on a paused clock.

use prealigner::alarms::TableCatalog;
use prealigner::error::PrealignError;
use prealigner::hardware::{
    LinkKind, Nxc100Simulator, SimulatorConfig, VisionReplyMode, VisionSimulator,
};
use prealigner::notify::{BroadcastSink, SequenceEvent};
use prealigner::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{timeout, Instant};

struct Plant {
    handle: SequenceHandle,
    events: broadcast::Receiver<SequenceEvent>,
    device: Nxc100Simulator,
    vision: VisionSimulator,
}

async fn plant(vision_mode: VisionReplyMode, settings: ControllerSettings) -> Plant {
    let sink = BroadcastSink::new(1024);
    let events = sink.subscribe();
    let catalog = TableCatalog::from_toml_str(
        r#"
[alarms."0005"]
message = "Vacuum not reached"
cause = "Wafer not seated"
potential_causes = ["Vacuum line leak"]
"#,
    )
    .unwrap();
    let actor = SequenceActor::new(
        Arc::new(sink),
        Arc::new(catalog),
        CommandTable::standard(),
        settings,
    );
    let (handle, _task) = actor.spawn();

    let device = Nxc100Simulator::new(SimulatorConfig::default());
    let (ours, theirs) = tokio::io::duplex(1024);
    let server = device.clone();
    tokio::spawn(async move { server.serve(theirs).await });
    handle
        .attach(LinkKind::Serial, Box::new(ours), "sim")
        .await
        .unwrap();

    let vision = VisionSimulator::new(vision_mode);
    let (ours, theirs) = tokio::io::duplex(1024);
    let server = vision.clone();
    tokio::spawn(async move { server.serve(theirs).await });
    handle
        .attach(LinkKind::Vision, Box::new(ours), "vision-sim")
        .await
        .unwrap();

    Plant {
        handle,
        events,
        device,
        vision,
    }
}

/// Collect events until the sequence stops.
async fn until_stopped(events: &mut broadcast::Receiver<SequenceEvent>) -> Vec<SequenceEvent> {
    let mut seen = Vec::new();
    let result = timeout(Duration::from_secs(600), async {
        loop {
            let event = events.recv().await.unwrap();
            let stopped = matches!(event, SequenceEvent::SequenceStopped { .. });
            seen.push(event);
            if stopped {
                break;
            }
        }
    })
    .await;
    assert!(result.is_ok(), "sequence never stopped: {seen:?}");
    seen
}

#[tokio::test(start_paused = true)]
async fn two_cycles_complete_against_simulators() {
    let mut plant = plant(VisionReplyMode::Acknowledge, ControllerSettings::default()).await;
    let started = Instant::now();
    plant.handle.start(2).await.unwrap();

    let events = until_stopped(&mut plant.events).await;

    assert!(events.iter().any(|e| matches!(
        e,
        SequenceEvent::SequenceStopped {
            reason: StopReason::Completed,
            completed_cycles: 2,
            total_cycles: 2,
        }
    )));
    let offsets: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SequenceEvent::OffsetMeasured {
                distance_mm,
                angle_deg,
            } => Some((*distance_mm, *angle_deg)),
            _ => None,
        })
        .collect();
    assert_eq!(offsets.len(), 2);
    assert!((offsets[0].0 - 0.17).abs() < 1e-9);

    // Two cycles of 0.5 s MTRS + 5 s MALN + 3 s settle, plus one 0.1 s restart.
    assert!(started.elapsed() >= Duration::from_millis(2 * 8500 + 100));

    assert_eq!(
        plant.device.received(),
        vec!["$2MTRSG100ALDD", "$2MALN1009000B4", "$2MTRSG100ALDD", "$2MALN1009000B4"]
    );
    assert_eq!(plant.vision.received(), vec!["T1", "T1"]);

    let status = plant.handle.status().await.unwrap();
    assert_eq!(status.step, SequenceStep::Idle);
    assert_eq!(status.cycles.completed_cycles, 2);
    assert!(!status.cycles.running);
}

#[tokio::test(start_paused = true)]
async fn injected_alarm_halts_until_cleared() {
    let mut plant = plant(VisionReplyMode::Acknowledge, ControllerSettings::default()).await;
    plant.device.fail_next(CommandTag::Maln, "0005", "0002");
    plant.handle.start(3).await.unwrap();

    let events = until_stopped(&mut plant.events).await;
    let raised = events.iter().find_map(|e| match e {
        SequenceEvent::AlarmRaised {
            code,
            subcode,
            description,
        } => Some((code.clone(), subcode.clone(), description.clone())),
        _ => None,
    });
    let (code, subcode, description) = raised.unwrap();
    assert_eq!((code.as_str(), subcode.as_str()), ("0005", "0002"));
    assert_eq!(description.unwrap().message, "Vacuum not reached");
    assert!(plant.vision.received().is_empty());

    assert!(matches!(
        plant.handle.start(3).await,
        Err(PrealignError::AlarmLatched { .. })
    ));

    plant.handle.clear().await.unwrap();
    let status = plant.handle.status().await.unwrap();
    assert!(status.latched_alarm.is_none());

    // Let the CCLR completion free the slot, then the next start goes through.
    tokio::time::sleep(Duration::from_millis(10)).await;
    plant.handle.start(1).await.unwrap();
    let events = until_stopped(&mut plant.events).await;
    assert!(events.iter().any(|e| matches!(
        e,
        SequenceEvent::SequenceStopped {
            reason: StopReason::Completed,
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn stop_during_motion_sends_nothing_more() {
    let mut plant = plant(VisionReplyMode::Acknowledge, ControllerSettings::default()).await;
    plant.handle.start(5).await.unwrap();

    // MTRS finishes after 0.5 s; stop while MALN is running.
    tokio::time::sleep(Duration::from_secs(2)).await;
    plant.handle.stop().await.unwrap();
    let events = until_stopped(&mut plant.events).await;
    assert!(events.iter().any(|e| matches!(
        e,
        SequenceEvent::SequenceStopped {
            reason: StopReason::Requested,
            completed_cycles: 0,
            ..
        }
    )));

    // The MALN completion still arrives, but nothing follows it.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(
        plant.device.received(),
        vec!["$2MTRSG100ALDD", "$2MALN1009000B4"]
    );
    assert!(plant.vision.received().is_empty());
}

#[tokio::test(start_paused = true)]
async fn silent_vision_halts_under_halt_policy() {
    let settings = ControllerSettings {
        on_reply_timeout: ReplyTimeoutPolicy::Halt,
        ..ControllerSettings::default()
    };
    let mut plant = plant(VisionReplyMode::Silent, settings).await;
    plant.handle.start(2).await.unwrap();

    let events = until_stopped(&mut plant.events).await;
    assert!(events.iter().any(|e| matches!(
        e,
        SequenceEvent::TriggerTimedOut {
            counted_as_acknowledged: false
        }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        SequenceEvent::SequenceStopped {
            reason: StopReason::Fault,
            completed_cycles: 0,
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn silent_vision_counts_cycles_by_default() {
    let mut plant = plant(VisionReplyMode::Silent, ControllerSettings::default()).await;
    plant.handle.start(1).await.unwrap();

    let events = until_stopped(&mut plant.events).await;
    assert!(events.iter().any(|e| matches!(
        e,
        SequenceEvent::TriggerTimedOut {
            counted_as_acknowledged: true
        }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        SequenceEvent::SequenceStopped {
            reason: StopReason::Completed,
            completed_cycles: 1,
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn disconnecting_serial_halts_the_sequence() {
    let mut plant = plant(VisionReplyMode::Acknowledge, ControllerSettings::default()).await;
    plant.handle.start(2).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    plant.handle.disconnect(LinkKind::Serial).await.unwrap();
    let events = until_stopped(&mut plant.events).await;
    assert!(events.iter().any(|e| matches!(
        e,
        SequenceEvent::Fault {
            kind: ErrorKind::TransportUnavailable,
            ..
        }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        SequenceEvent::ConnectionStatus {
            link: LinkKind::Serial,
            connected: false,
        }
    )));

    let status = plant.handle.status().await.unwrap();
    assert!(!status.cycles.running);
    assert!(!status.command_outstanding);
    assert!(matches!(
        plant.handle.start(1).await,
        Err(PrealignError::TransportUnavailable(LinkKind::Serial))
    ));
}
