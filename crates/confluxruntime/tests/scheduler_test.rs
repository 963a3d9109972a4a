use confluxcore::{
    EventBus, ExecutionEvent, FlowId, FlowStatus, ResourceEstimate, ValidationError,
};
use confluxruntime::{FlowOutcome, FlowRegistration, FlowScheduler, QueuePolicy, SchedulerConfig};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

fn id(name: &str) -> FlowId {
    FlowId::new(name)
}

fn flow(priority: i32, dependencies: &[&str]) -> FlowRegistration {
    FlowRegistration {
        priority,
        dependencies: dependencies.iter().map(|d| id(d)).collect(),
        ..FlowRegistration::default()
    }
}

fn with_cpu(priority: i32, cpu: f64) -> FlowRegistration {
    FlowRegistration {
        priority,
        resources: ResourceEstimate::new(cpu, 0.1, 0.1, 0.1),
        ..FlowRegistration::default()
    }
}

fn complete(scheduler: &mut FlowScheduler, name: &str) {
    scheduler
        .report_finished(&id(name), FlowOutcome::Completed)
        .unwrap();
}

#[tokio::test]
async fn test_cycle_is_rejected_without_mutation() {
    init_tracing();

    let mut scheduler = FlowScheduler::new(SchedulerConfig::default());
    scheduler.register_flow(id("a"), flow(0, &[])).unwrap();
    scheduler.register_flow(id("b"), flow(0, &["a"])).unwrap();
    scheduler.register_flow(id("c"), flow(0, &["b"])).unwrap();
    let edges_before = scheduler.edges();

    // a depending on c closes a -> b -> c -> a
    let err = scheduler.add_dependency(&id("a"), &id("c")).unwrap_err();
    assert_eq!(
        err,
        ValidationError::CyclicDependency {
            dependency: "c".to_string(),
            dependent: "a".to_string(),
        }
    );
    assert_eq!(scheduler.edges(), edges_before);
    assert_eq!(scheduler.status(&id("a")), Some(FlowStatus::Ready));

    let err = scheduler.add_dependency(&id("b"), &id("b")).unwrap_err();
    assert!(matches!(err, ValidationError::CyclicDependency { .. }));
    assert_eq!(scheduler.edges(), edges_before);
}

#[tokio::test]
async fn test_non_cyclic_edges_are_accepted() {
    init_tracing();

    let mut scheduler = FlowScheduler::new(SchedulerConfig::default());
    for name in ["a", "b", "c"] {
        scheduler.register_flow(id(name), flow(0, &[])).unwrap();
    }
    scheduler.add_dependency(&id("c"), &id("a")).unwrap();
    scheduler.add_dependency(&id("c"), &id("b")).unwrap();
    scheduler.add_dependency(&id("b"), &id("a")).unwrap();

    assert_eq!(scheduler.edges().len(), 3);
    assert!(scheduler.add_dependency(&id("a"), &id("c")).is_err());
    assert!(scheduler.add_dependency(&id("a"), &id("missing")).is_err());
}

#[tokio::test]
async fn test_registration_validates_dependencies_and_resources() {
    init_tracing();

    let mut scheduler = FlowScheduler::new(SchedulerConfig::default());
    let err = scheduler
        .register_flow(id("b"), flow(0, &["a"]))
        .unwrap_err();
    assert_eq!(err, ValidationError::FlowNotFound("a".to_string()));

    let err = scheduler
        .register_flow(id("huge"), with_cpu(0, 1.5))
        .unwrap_err();
    assert!(matches!(err, ValidationError::Invalid(_)));

    scheduler.register_flow(id("a"), flow(0, &[])).unwrap();
    let err = scheduler.register_flow(id("a"), flow(0, &[])).unwrap_err();
    assert_eq!(err, ValidationError::DuplicateFlow("a".to_string()));
}

#[tokio::test]
async fn test_dependent_starts_only_after_dependency_completes() {
    init_tracing();

    let mut scheduler = FlowScheduler::new(SchedulerConfig::default());
    scheduler.register_flow(id("a"), flow(1, &[])).unwrap();
    scheduler.register_flow(id("b"), flow(5, &["a"])).unwrap();

    assert_eq!(scheduler.schedule_flows(), vec![id("a")]);
    assert_eq!(scheduler.status(&id("b")), Some(FlowStatus::Pending));
    assert!(scheduler.schedule_flows().is_empty());

    complete(&mut scheduler, "a");
    assert_eq!(scheduler.schedule_flows(), vec![id("b")]);
    assert_eq!(scheduler.status(&id("a")), Some(FlowStatus::Completed));

    complete(&mut scheduler, "b");
    scheduler.schedule_flows();
    assert!(scheduler.all_terminal());
    assert_eq!(scheduler.stats().completed, 2);
}

#[tokio::test]
async fn test_new_dependency_moves_ready_flow_back_to_pending() {
    init_tracing();

    let mut scheduler = FlowScheduler::new(SchedulerConfig::default());
    scheduler.register_flow(id("a"), flow(0, &[])).unwrap();
    scheduler.register_flow(id("b"), flow(0, &[])).unwrap();
    assert_eq!(scheduler.status(&id("b")), Some(FlowStatus::Ready));

    scheduler.add_dependency(&id("b"), &id("a")).unwrap();

    assert_eq!(scheduler.status(&id("b")), Some(FlowStatus::Pending));
    assert_eq!(scheduler.ready_queue(), vec![id("a")]);
}

#[tokio::test]
async fn test_running_flow_cannot_gain_dependencies() {
    init_tracing();

    let mut scheduler = FlowScheduler::new(SchedulerConfig::default());
    scheduler.register_flow(id("a"), flow(0, &[])).unwrap();
    scheduler.schedule_flows();
    scheduler.register_flow(id("b"), flow(0, &[])).unwrap();

    let err = scheduler.add_dependency(&id("a"), &id("b")).unwrap_err();
    assert!(matches!(err, ValidationError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_higher_priority_dequeues_first() {
    init_tracing();

    let config = SchedulerConfig {
        max_concurrent: 1,
        ..SchedulerConfig::default()
    };
    let mut scheduler = FlowScheduler::new(config);
    scheduler.register_flow(id("low"), flow(3, &[])).unwrap();
    scheduler.register_flow(id("high"), flow(5, &[])).unwrap();

    assert_eq!(scheduler.schedule_flows(), vec![id("high")]);
    complete(&mut scheduler, "high");
    assert_eq!(scheduler.schedule_flows(), vec![id("low")]);
}

#[tokio::test]
async fn test_equal_priority_is_fifo() {
    init_tracing();

    let config = SchedulerConfig {
        max_concurrent: 3,
        ..SchedulerConfig::default()
    };
    let mut scheduler = FlowScheduler::new(config);
    for name in ["first", "second", "third"] {
        scheduler.register_flow(id(name), flow(2, &[])).unwrap();
    }

    assert_eq!(
        scheduler.schedule_flows(),
        vec![id("first"), id("second"), id("third")]
    );
}

#[tokio::test(start_paused = true)]
async fn test_aging_lets_waiting_flow_overtake_newer_arrivals() {
    init_tracing();

    let config = SchedulerConfig {
        max_concurrent: 1,
        max_queue_time_ms: 1000,
        priority_boost: 1,
        ..SchedulerConfig::default()
    };
    let mut scheduler = FlowScheduler::new(config);
    scheduler.register_flow(id("blocker"), flow(5, &[])).unwrap();
    scheduler.register_flow(id("old"), flow(3, &[])).unwrap();
    assert_eq!(scheduler.schedule_flows(), vec![id("blocker")]);

    tokio::time::advance(Duration::from_millis(2500)).await;
    scheduler.register_flow(id("fresh"), flow(4, &[])).unwrap();
    complete(&mut scheduler, "blocker");

    assert_eq!(scheduler.schedule_flows(), vec![id("old")]);
    assert_eq!(scheduler.flow(&id("old")).unwrap().priority, 5);
    assert!(scheduler.stats().priority_boosts >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_aging_is_capped() {
    init_tracing();

    let config = SchedulerConfig {
        max_concurrent: 1,
        max_queue_time_ms: 10,
        priority_boost: 50,
        ..SchedulerConfig::default()
    };
    let mut scheduler = FlowScheduler::new(config);
    scheduler.register_flow(id("blocker"), flow(1, &[])).unwrap();
    scheduler.schedule_flows();
    scheduler.register_flow(id("waiting"), flow(0, &[])).unwrap();

    tokio::time::advance(Duration::from_secs(5)).await;
    scheduler.schedule_flows();

    assert_eq!(scheduler.flow(&id("waiting")).unwrap().priority, 100);
}

#[tokio::test]
async fn test_flow_waits_until_resources_are_available() {
    init_tracing();

    let mut scheduler = FlowScheduler::new(SchedulerConfig::default());
    scheduler.register_flow(id("holder"), with_cpu(10, 0.5)).unwrap();
    scheduler.register_flow(id("big"), with_cpu(1, 0.8)).unwrap();

    assert_eq!(scheduler.schedule_flows(), vec![id("holder")]);
    assert_eq!(scheduler.status(&id("big")), Some(FlowStatus::Ready));
    assert!((scheduler.resources().available().cpu - 0.5).abs() < 1e-9);

    complete(&mut scheduler, "holder");
    assert_eq!(scheduler.schedule_flows(), vec![id("big")]);
    assert!((scheduler.resources().allocated().cpu - 0.8).abs() < 1e-9);
}

#[tokio::test]
async fn test_head_of_line_blocking_is_configurable() {
    init_tracing();

    for (policy, expected) in [
        (QueuePolicy::HeadOfLine, Vec::new()),
        (QueuePolicy::SkipBlocked, vec![id("small")]),
    ] {
        let config = SchedulerConfig {
            queue_policy: policy,
            ..SchedulerConfig::default()
        };
        let mut scheduler = FlowScheduler::new(config);
        scheduler.register_flow(id("holder"), with_cpu(0, 0.5)).unwrap();
        assert_eq!(scheduler.schedule_flows(), vec![id("holder")]);

        scheduler.register_flow(id("big"), with_cpu(5, 0.8)).unwrap();
        scheduler.register_flow(id("small"), with_cpu(1, 0.2)).unwrap();

        assert_eq!(scheduler.schedule_flows(), expected, "{:?}", policy);
        assert_eq!(scheduler.ready_queue()[0], id("big"));
    }
}

#[tokio::test]
async fn test_backpressure_holds_dispatch_above_threshold() {
    init_tracing();

    let mut scheduler = FlowScheduler::new(SchedulerConfig::default());
    scheduler.register_flow(id("heavy"), with_cpu(1, 0.95)).unwrap();
    assert_eq!(scheduler.schedule_flows(), vec![id("heavy")]);

    scheduler.register_flow(id("light"), with_cpu(0, 0.01)).unwrap();
    assert!(scheduler.schedule_flows().is_empty());
    assert!(scheduler.stats().backpressure_events >= 1);

    complete(&mut scheduler, "heavy");
    assert_eq!(scheduler.schedule_flows(), vec![id("light")]);
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    init_tracing();

    let config = SchedulerConfig {
        max_concurrent: 2,
        ..SchedulerConfig::default()
    };
    let mut scheduler = FlowScheduler::new(config);
    for name in ["a", "b", "c"] {
        scheduler.register_flow(id(name), flow(0, &[])).unwrap();
    }

    assert_eq!(scheduler.schedule_flows().len(), 2);
    assert_eq!(scheduler.running_count(), 2);
    assert!(scheduler.schedule_flows().is_empty());
}

#[tokio::test]
async fn test_cancel_only_before_start() {
    init_tracing();

    let mut scheduler = FlowScheduler::new(SchedulerConfig::default());
    scheduler.register_flow(id("a"), flow(0, &[])).unwrap();
    scheduler.register_flow(id("b"), flow(0, &["a"])).unwrap();

    scheduler.cancel_flow(&id("b"), "not needed").unwrap();
    assert_eq!(scheduler.status(&id("b")), Some(FlowStatus::Cancelled));
    assert_eq!(
        scheduler.flow(&id("b")).unwrap().cancel_reason.as_deref(),
        Some("not needed")
    );

    assert_eq!(scheduler.schedule_flows(), vec![id("a")]);
    let err = scheduler.cancel_flow(&id("a"), "too late").unwrap_err();
    assert!(matches!(err, ValidationError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_failed_dependency_stalls_dependents() {
    init_tracing();

    let bus = Arc::new(EventBus::new(100));
    let mut events = bus.subscribe();
    let mut scheduler = FlowScheduler::new(SchedulerConfig::default()).with_event_bus(bus);
    scheduler.register_flow(id("a"), flow(0, &[])).unwrap();
    scheduler.register_flow(id("b"), flow(0, &["a"])).unwrap();

    scheduler.schedule_flows();
    scheduler
        .report_finished(&id("a"), FlowOutcome::Failed)
        .unwrap();
    assert!(scheduler.schedule_flows().is_empty());

    assert_eq!(scheduler.status(&id("a")), Some(FlowStatus::Failed));
    assert_eq!(scheduler.status(&id("b")), Some(FlowStatus::Pending));
    assert!(scheduler.is_stalled());
    assert!(scheduler.stats().stalled);
    assert_eq!(scheduler.blocked_flows(), vec![id("b")]);

    let mut stalled = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::SchedulerStalled { blocked, .. } = event {
            stalled = blocked;
        }
    }
    assert_eq!(stalled, vec![id("b")]);
}

#[tokio::test]
async fn test_skipped_flow_ends_cancelled() {
    init_tracing();

    let mut scheduler = FlowScheduler::new(SchedulerConfig::default());
    scheduler.register_flow(id("a"), flow(0, &[])).unwrap();
    scheduler.schedule_flows();

    scheduler
        .report_finished(&id("a"), FlowOutcome::Skipped)
        .unwrap();
    scheduler.schedule_flows();

    assert_eq!(scheduler.status(&id("a")), Some(FlowStatus::Cancelled));
    assert!(scheduler.all_terminal());
    assert!(scheduler
        .report_finished(&id("a"), FlowOutcome::Completed)
        .is_err());
}

#[tokio::test(start_paused = true)]
async fn test_completed_durations_feed_predictions() {
    init_tracing();

    let mut scheduler = FlowScheduler::new(SchedulerConfig::default());
    scheduler
        .register_flow(
            id("first"),
            FlowRegistration {
                flow_type: Some("etl".to_string()),
                ..FlowRegistration::default()
            },
        )
        .unwrap();
    scheduler.schedule_flows();
    tokio::time::advance(Duration::from_millis(200)).await;
    complete(&mut scheduler, "first");
    scheduler.schedule_flows();

    scheduler
        .register_flow(
            id("second"),
            FlowRegistration {
                flow_type: Some("etl".to_string()),
                ..FlowRegistration::default()
            },
        )
        .unwrap();
    let predicted = scheduler.predict_execution_time(&id("second")).unwrap();
    assert!((predicted - 200.0).abs() < 1e-6, "predicted {}", predicted);

    // No history for this type: default plus a per-dependency allowance
    scheduler.register_flow(id("fresh"), flow(0, &["first"])).unwrap();
    let predicted = scheduler.predict_execution_time(&id("fresh")).unwrap();
    assert!((predicted - 1500.0).abs() < 1e-6, "predicted {}", predicted);
}

#[tokio::test]
async fn test_reset_run_rearms_all_flows() {
    init_tracing();

    let mut scheduler = FlowScheduler::new(SchedulerConfig::default());
    scheduler.register_flow(id("a"), flow(0, &[])).unwrap();
    scheduler.register_flow(id("b"), flow(0, &["a"])).unwrap();
    scheduler.schedule_flows();
    complete(&mut scheduler, "a");
    scheduler.schedule_flows();

    scheduler.reset_run();

    assert_eq!(scheduler.status(&id("a")), Some(FlowStatus::Ready));
    assert_eq!(scheduler.status(&id("b")), Some(FlowStatus::Pending));
    assert_eq!(scheduler.running_count(), 0);
    assert!(scheduler.resources().allocated().cpu.abs() < 1e-9);

    scheduler.reset();
    assert!(scheduler.flow_ids().is_empty());
}
