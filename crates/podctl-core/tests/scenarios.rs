//! End-to-end scenarios for podctl-core
//!
//! Every test drives a [`PodCoordinator`] against the scripted
//! [`MockExecutor`] with a [`ManualClock`], so no radio or wall-clock waits
//! are involved.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use podctl_core::{
    BasalProfile, BasalSegment, Command, CommandKind, CustomAction, DriverState, FailureKind,
    InMemoryHistory, InMemoryPreferences, ManualClock, MockExecutor, MockExecutorBuilder,
    MockFailure, PodCoordinator, PodEvent, PreferenceStatistics, StatisticKey, TreatmentRecord,
};
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

const START: OffsetDateTime = datetime!(2024-03-10 14:00 UTC);

struct Session {
    pod: Arc<MockExecutor>,
    clock: Arc<ManualClock>,
    history: Arc<InMemoryHistory>,
    statistics: Arc<PreferenceStatistics>,
    coordinator: Arc<PodCoordinator>,
}

fn session(pod: MockExecutor) -> Session {
    let pod = Arc::new(pod);
    let clock = Arc::new(ManualClock::new(START));
    let history = Arc::new(InMemoryHistory::new());
    let preferences = Arc::new(InMemoryPreferences::new());
    let statistics = Arc::new(PreferenceStatistics::new(preferences.clone()));
    let coordinator = PodCoordinator::builder(pod.clone())
        .clock(clock.clone())
        .history(history.clone())
        .preferences(preferences)
        .statistics(statistics.clone())
        .build()
        .unwrap();

    Session {
        pod,
        clock,
        history,
        statistics,
        coordinator: Arc::new(coordinator),
    }
}

/// Bring the session to `Initialized` with a fresh status and an empty log.
async fn connect(s: &Session) {
    let mut events = s.coordinator.subscribe();
    s.coordinator.on_transport_connected().await;
    loop {
        match events.recv().await.unwrap() {
            PodEvent::PodReady { .. } => break,
            PodEvent::ProbeExhausted { attempts } => panic!("pod never ready after {attempts}"),
            _ => {}
        }
    }
    assert_eq!(
        s.coordinator.get_pump_status(true).await.unwrap(),
        DriverState::Initialized
    );
    s.pod.clear_log();
}

fn scheduled() -> BasalProfile {
    BasalProfile::new(vec![
        BasalSegment::at(0, 0, 0.7),
        BasalSegment::at(6, 0, 1.0),
        BasalSegment::at(22, 0, 0.8),
    ])
    .unwrap()
}

// =============================================================================
// Bolus
// =============================================================================

#[tokio::test]
async fn test_bolus_updates_reservoir_history_and_busy_window() {
    let s = session(MockExecutor::new());
    connect(&s).await;

    let result = s.coordinator.deliver_bolus(2.0, 30.0, false).await;

    assert!(result.success());
    assert!(result.enacted());
    assert_eq!(result.effects().bolus_delivered, Some(2.0));
    assert_eq!(result.effects().carbs_delivered, Some(30.0));
    assert_eq!(s.coordinator.reservoir_level().await, 98.0);
    assert_eq!(s.statistics.get(StatisticKey::StandardBoluses), 1);
    assert_eq!(s.statistics.get(StatisticKey::SmbBoluses), 0);
    assert_eq!(
        s.history.records(),
        vec![TreatmentRecord::Bolus {
            units: 2.0,
            carbs: 30.0,
            at: START
        }]
    );

    // 2.0 U at 42 s/U keeps the pod busy for 84 s
    s.clock.advance(Duration::seconds(83));
    assert!(s.coordinator.is_busy().await);
    s.clock.advance(Duration::seconds(1));
    assert!(!s.coordinator.is_busy().await);
}

#[tokio::test]
async fn test_smb_counts_separately() {
    let s = session(MockExecutor::new());
    connect(&s).await;

    assert!(s.coordinator.deliver_bolus(0.3, 0.0, true).await.enacted());
    assert_eq!(s.statistics.get(StatisticKey::SmbBoluses), 1);
    assert_eq!(s.statistics.get(StatisticKey::StandardBoluses), 0);
}

#[tokio::test]
async fn test_uncertain_bolus_leaves_state_alone() {
    let s = session(
        MockExecutorBuilder::new()
            .failure(MockFailure::Timeout)
            .build(),
    );
    connect(&s).await;
    s.pod.set_transient_failures(1);

    let result = s.coordinator.deliver_bolus(1.5, 0.0, false).await;

    assert!(!result.success());
    assert_eq!(result.failure(), Some(FailureKind::Uncertain));
    assert_eq!(s.coordinator.reservoir_level().await, 100.0);
    assert!(s.history.is_empty());
    assert_eq!(s.statistics.get(StatisticKey::StandardBoluses), 0);
    assert!(!s.coordinator.is_busy().await);
    // no automatic retry
    assert_eq!(s.pod.dispatched_kinds(), vec![CommandKind::SetBolus]);
}

#[tokio::test]
async fn test_nack_is_uncertain() {
    let s = session(MockExecutorBuilder::new().failure(MockFailure::Nack).build());
    connect(&s).await;
    s.pod.set_transient_failures(1);

    let result = s.coordinator.deliver_bolus(1.0, 0.0, false).await;
    assert_eq!(result.failure(), Some(FailureKind::Uncertain));
}

#[tokio::test]
async fn test_busy_pod_refuses_new_commands() {
    let s = session(MockExecutor::new());
    connect(&s).await;
    s.coordinator.deliver_bolus(1.0, 0.0, false).await;
    s.pod.clear_log();

    let bolus = s.coordinator.deliver_bolus(1.0, 0.0, false).await;
    let tbr = s
        .coordinator
        .set_temp_basal_absolute(1.0, 30, &scheduled(), false)
        .await;
    let profile = s.coordinator.set_new_basal_profile(scheduled()).await;

    for result in [bolus, tbr, profile] {
        assert_eq!(result.failure(), Some(FailureKind::Busy));
    }
    assert_eq!(s.pod.dispatch_count(), 0);
    assert_eq!(s.coordinator.metrics().busy_refusals, 3);
}

#[tokio::test]
async fn test_reservoir_discrepancy_is_reported() {
    let s = session(MockExecutorBuilder::new().reservoir(1.0).build());
    connect(&s).await;
    let mut events = s.coordinator.subscribe();

    let result = s.coordinator.deliver_bolus(2.5, 0.0, false).await;
    assert!(result.enacted());
    assert_eq!(s.coordinator.reservoir_level().await, 0.0);
    assert!(s.coordinator.status_snapshot().await.has_reservoir_discrepancy());

    let mut reported = None;
    while let Ok(event) = events.try_recv() {
        if let PodEvent::ReservoirDiscrepancy {
            requested,
            available,
        } = event
        {
            reported = Some((requested, available));
        }
    }
    assert_eq!(reported, Some((2.5, 1.0)));
}

// =============================================================================
// Temporary basal
// =============================================================================

#[tokio::test]
async fn test_same_rate_short_circuits() {
    let s = session(MockExecutor::new());
    connect(&s).await;
    let profile = scheduled();

    let first = s
        .coordinator
        .set_temp_basal_absolute(1.5, 60, &profile, false)
        .await;
    assert!(first.enacted());
    s.clock.advance(Duration::minutes(5));

    let second = s
        .coordinator
        .set_temp_basal_absolute(1.5, 60, &profile, false)
        .await;
    assert!(second.success());
    assert!(!second.enacted());
    assert_eq!(second.effects().absolute_rate, Some(1.5));
    assert_eq!(second.effects().duration_minutes, Some(60));

    assert_eq!(s.pod.dispatched_kinds(), vec![CommandKind::SetTemporaryBasal]);
    assert_eq!(s.history.len(), 1);
    assert_eq!(s.statistics.get(StatisticKey::TbrsSet), 1);
    assert_eq!(s.coordinator.metrics().short_circuits, 1);
}

#[tokio::test]
async fn test_new_rate_cancels_then_sets() {
    let s = session(MockExecutor::new());
    connect(&s).await;
    let profile = scheduled();

    s.coordinator
        .set_temp_basal_absolute(1.0, 60, &profile, false)
        .await;
    s.clock.advance(Duration::minutes(5));
    let result = s
        .coordinator
        .set_temp_basal_absolute(2.0, 30, &profile, false)
        .await;

    assert!(result.enacted());
    assert_eq!(result.effects().absolute_rate, Some(2.0));
    assert_eq!(
        s.pod.dispatched(),
        vec![
            Command::SetTemporaryBasal {
                rate: 1.0,
                duration_minutes: 60,
            },
            Command::CancelTemporaryBasal,
            Command::SetTemporaryBasal {
                rate: 2.0,
                duration_minutes: 30,
            },
        ]
    );
    let tbr = s.coordinator.active_temp_basal().await.unwrap();
    assert_eq!(tbr.rate(), 2.0);
    assert_eq!(tbr.start(), START + Duration::minutes(5));
    assert_eq!(tbr.end(), START + Duration::minutes(35));
    assert_eq!(s.statistics.get(StatisticKey::TbrsSet), 2);
}

#[tokio::test]
async fn test_refused_cancel_stops_the_sequence() {
    let s = session(MockExecutor::new());
    connect(&s).await;
    let profile = scheduled();
    s.coordinator
        .set_temp_basal_absolute(1.5, 60, &profile, false)
        .await;
    s.pod.set_refuse(CommandKind::CancelTemporaryBasal, true);
    s.pod.clear_log();

    let result = s
        .coordinator
        .set_temp_basal_absolute(0.5, 30, &profile, false)
        .await;

    assert!(!result.success());
    assert_eq!(result.failure(), Some(FailureKind::Refused));
    assert_eq!(result.comment(), Some("can't cancel TBR, stopping operation"));
    assert_eq!(s.pod.dispatched_kinds(), vec![CommandKind::CancelTemporaryBasal]);
    assert_eq!(s.coordinator.active_temp_basal().await.unwrap().rate(), 1.5);
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let s = session(MockExecutor::new());
    connect(&s).await;
    s.coordinator
        .set_temp_basal_absolute(2.0, 30, &scheduled(), false)
        .await;
    s.pod.clear_log();

    let first = s.coordinator.cancel_temp_basal().await;
    let second = s.coordinator.cancel_temp_basal().await;

    assert!(first.enacted());
    assert!(first.is_temp_cancel());
    assert!(second.success());
    assert!(!second.enacted());
    assert_eq!(s.pod.dispatched_kinds(), vec![CommandKind::CancelTemporaryBasal]);
    assert!(matches!(
        s.history.records().last(),
        Some(TreatmentRecord::TemporaryBasal {
            rate: None,
            duration_minutes: 0,
            ..
        })
    ));
}

#[tokio::test]
async fn test_expired_temp_basal_reads_as_none() {
    let s = session(MockExecutor::new());
    connect(&s).await;
    s.coordinator
        .set_temp_basal_absolute(2.0, 30, &scheduled(), false)
        .await;

    s.clock.advance(Duration::minutes(29));
    assert!(s.coordinator.active_temp_basal().await.is_some());
    s.clock.advance(Duration::minutes(1));
    assert!(s.coordinator.active_temp_basal().await.is_none());
}

// =============================================================================
// Basal profile
// =============================================================================

#[tokio::test]
async fn test_equal_profile_is_not_resent() {
    let s = session(MockExecutor::new());
    connect(&s).await;

    let first = s.coordinator.set_new_basal_profile(scheduled()).await;
    assert!(first.enacted());

    // same behaviour, redundant breakpoint
    let same = BasalProfile::new(vec![
        BasalSegment::at(0, 0, 0.7),
        BasalSegment::at(3, 0, 0.7),
        BasalSegment::at(6, 0, 1.0),
        BasalSegment::at(22, 0, 0.8),
    ])
    .unwrap();
    let second = s.coordinator.set_new_basal_profile(same).await;

    assert!(second.success());
    assert!(!second.enacted());
    assert_eq!(second.comment(), Some("basal profile is the same, not set"));
    assert_eq!(s.pod.dispatched_kinds(), vec![CommandKind::SetBasalProfile]);

    // 14:00 falls in the 06:00 segment
    assert_eq!(s.coordinator.get_base_basal_rate().await, 1.0);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_unreachable_pod_refuses_until_status_succeeds() {
    let s = session(MockExecutor::new());
    connect(&s).await;
    let mut events = s.coordinator.subscribe();

    s.pod.set_transient_failures(1);
    assert!(s.coordinator.get_pump_status(true).await.is_err());
    assert_eq!(s.coordinator.state().await, DriverState::Unreachable);

    let refused = s.coordinator.deliver_bolus(1.0, 0.0, false).await;
    assert_eq!(refused.failure(), Some(FailureKind::NotReady));

    assert_eq!(
        s.coordinator.get_pump_status(true).await.unwrap(),
        DriverState::Initialized
    );
    assert!(s.coordinator.deliver_bolus(1.0, 0.0, false).await.enacted());

    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PodEvent::StateChanged { from, to } = event {
            transitions.push((from, to));
        }
    }
    assert_eq!(
        transitions,
        vec![
            (DriverState::Initialized, DriverState::Unreachable),
            (DriverState::Unreachable, DriverState::Initialized),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_probe_exhaustion_keeps_driver_connecting() {
    let s = session(MockExecutorBuilder::new().never_ready().build());
    let mut events = s.coordinator.subscribe();
    s.coordinator.on_transport_connected().await;

    loop {
        if let PodEvent::ProbeExhausted { attempts } = events.recv().await.unwrap() {
            assert_eq!(attempts, 20);
            break;
        }
    }
    assert_eq!(s.coordinator.state().await, DriverState::Connecting);
    assert!(s.coordinator.get_pump_status(true).await.is_err());
}

#[tokio::test]
async fn test_custom_actions_follow_pod_state() {
    let s = session(MockExecutorBuilder::new().pod_active(false).build());
    connect(&s).await;

    assert!(
        s.coordinator
            .execute_custom_action(CustomAction::DeactivatePod)
            .await
            .is_err()
    );
    assert!(
        s.coordinator
            .execute_custom_action(CustomAction::InitPod)
            .await
            .unwrap()
    );
    assert!(
        s.coordinator
            .execute_custom_action(CustomAction::ResetPodStatus)
            .await
            .unwrap()
    );
    assert_eq!(
        s.pod.dispatched_kinds(),
        vec![CommandKind::InitPod, CommandKind::ResetPodStatus]
    );
    assert_eq!(s.coordinator.serial_number().await, "");
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_never_overlap_on_the_wire() {
    let s = session(
        MockExecutorBuilder::new()
            .latency(StdDuration::from_millis(5))
            .build(),
    );
    connect(&s).await;
    let profile = scheduled();

    let mut requests = Vec::new();
    for i in 0..8u32 {
        let coordinator = Arc::clone(&s.coordinator);
        let profile = profile.clone();
        requests.push(tokio::spawn(async move {
            match i % 4 {
                0 => coordinator.cancel_temp_basal().await,
                1 => {
                    coordinator
                        .set_temp_basal_absolute(f64::from(i) / 4.0, 30, &profile, false)
                        .await
                }
                2 => coordinator.stop_bolus_delivering().await,
                _ => coordinator.set_new_basal_profile(profile).await,
            }
        }));
    }
    let results = futures::future::join_all(requests).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(s.pod.max_in_flight(), 1);
}

// =============================================================================
// Property tests
// =============================================================================

mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    proptest! {
        /// Each bolus lowers the reservoir estimate by exactly its size,
        /// clamping at zero.
        #[test]
        fn reservoir_drops_by_each_bolus(
            start in 0.0f64..20.0,
            boluses in proptest::collection::vec(0.05f64..8.0, 1..12),
        ) {
            runtime().block_on(async {
                let s = session(MockExecutorBuilder::new().reservoir(start).build());
                connect(&s).await;
                for units in boluses {
                    let before = s.coordinator.reservoir_level().await;
                    let result = s.coordinator.deliver_bolus(units, 0.0, false).await;
                    prop_assert!(result.enacted());

                    let after = s.coordinator.reservoir_level().await;
                    let expected = before - units;
                    if expected >= 0.0 {
                        prop_assert_eq!(after, expected);
                    } else {
                        prop_assert_eq!(after, 0.0);
                    }
                    s.clock.advance(Duration::minutes(10));
                }
                Ok(())
            })?;
        }

        /// A running temporary basal always spans exactly its duration.
        #[test]
        fn temp_basal_window_matches_duration(
            rate in 0.0f64..30.0,
            duration in 1u32..=720,
        ) {
            runtime().block_on(async {
                let s = session(MockExecutor::new());
                connect(&s).await;
                let result = s
                    .coordinator
                    .set_temp_basal_absolute(rate, duration, &scheduled(), false)
                    .await;
                prop_assert!(result.enacted());

                let tbr = s.coordinator.active_temp_basal().await.unwrap();
                prop_assert_eq!(tbr.end() - tbr.start(), Duration::minutes(i64::from(duration)));
                Ok(())
            })?;
        }
    }
}
