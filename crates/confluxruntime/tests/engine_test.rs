use confluxcore::{
    EventBus, ExecutionEvent, Flow, FlowState, InMemoryStatePersistence, StatePersistence,
    StepContext, StepError, StepOutput, StepSpec, TriggerCondition, Value,
};
use confluxruntime::{EngineConfig, FlowEngine};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
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

fn engine(flow: &Flow) -> FlowEngine {
    FlowEngine::new(flow, EngineConfig::default(), Arc::new(EventBus::new(100)))
        .expect("valid flow")
}

/// Step returning a fixed value
fn constant(
    value: f64,
) -> impl Fn(StepContext) -> futures::future::Ready<Result<StepOutput, StepError>> + Send + Sync {
    move |_ctx: StepContext| futures::future::ready(Ok(StepOutput::new(value)))
}

/// Step counting its invocations and echoing its input
fn counting(
    counter: Arc<AtomicUsize>,
) -> impl Fn(StepContext) -> futures::future::Ready<Result<StepOutput, StepError>> + Send + Sync {
    move |ctx: StepContext| {
        counter.fetch_add(1, Ordering::SeqCst);
        futures::future::ready(Ok(StepOutput::new(ctx.input)))
    }
}

#[tokio::test]
async fn test_and_listener_waits_for_every_source() {
    init_tracing();

    let joined = Arc::new(AtomicUsize::new(0));
    let flow = Flow::builder("and-join")
        .step(StepSpec::start("x", constant(1.0)))
        .step(StepSpec::start("y", constant(2.0)))
        .step(StepSpec::listen(
            "join",
            TriggerCondition::all(["x", "y"]),
            counting(joined.clone()),
        ))
        .build()
        .unwrap();

    let outcome = engine(&flow).run(BTreeMap::new()).await.unwrap();

    assert_eq!(joined.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.steps_executed, 3);
    assert!(outcome.succeeded());
}

#[tokio::test]
async fn test_and_listener_rearms_after_firing() {
    init_tracing();

    let joined = Arc::new(AtomicUsize::new(0));
    let flow = Flow::builder("and-rearm")
        .step(StepSpec::start("x", constant(1.0)).no_memo())
        .step(StepSpec::start("y", constant(2.0)).no_memo())
        .step(
            StepSpec::listen(
                "join",
                TriggerCondition::all(["x", "y"]),
                counting(joined.clone()),
            )
            .no_memo(),
        )
        .build()
        .unwrap();
    let engine = engine(&flow);

    engine.execute_step("x", Value::Null).await.unwrap();
    assert_eq!(joined.load(Ordering::SeqCst), 0);

    engine.execute_step("y", Value::Null).await.unwrap();
    assert_eq!(joined.load(Ordering::SeqCst), 1);

    // x alone again must not re-trigger until y completes again
    engine.execute_step("x", Value::Null).await.unwrap();
    assert_eq!(joined.load(Ordering::SeqCst), 1);
    engine.execute_step("y", Value::Null).await.unwrap();
    assert_eq!(joined.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_or_listener_fires_for_each_source() {
    init_tracing();

    let calls = Arc::new(AtomicUsize::new(0));
    let flow = Flow::builder("or-join")
        .step(StepSpec::start("x", constant(1.0)))
        .step(StepSpec::start("y", constant(2.0)))
        .step(
            StepSpec::listen(
                "either",
                TriggerCondition::any(["x", "y"]),
                counting(calls.clone()),
            )
            .no_memo(),
        )
        .build()
        .unwrap();

    engine(&flow).run(BTreeMap::new()).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_memoized_step_expires_after_ttl() {
    init_tracing();

    let calls = Arc::new(AtomicUsize::new(0));
    let flow = Flow::builder("memo")
        .step(StepSpec::start("double", {
            let calls = calls.clone();
            move |ctx: StepContext| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let n = ctx.input.as_f64().unwrap_or(0.0);
                    Ok::<_, StepError>(StepOutput::new(n * 2.0))
                }
            }
        }))
        .build()
        .unwrap();
    let config = EngineConfig {
        cache_ttl_ms: 1000,
        ..EngineConfig::default()
    };
    let engine = FlowEngine::new(&flow, config, Arc::new(EventBus::new(100))).unwrap();

    let first = engine.execute_step("double", Value::from(21)).await.unwrap();
    assert_eq!(first, Value::from(42));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_millis(999)).await;
    let cached = engine.execute_step("double", Value::from(21)).await.unwrap();
    assert_eq!(cached, first);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_millis(2)).await;
    engine.execute_step("double", Value::from(21)).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(engine.cached_results(), 1);
}

#[tokio::test]
async fn test_router_stop_ends_flow_with_state_snapshot() {
    init_tracing();

    let after = Arc::new(AtomicUsize::new(0));
    let flow = Flow::builder("stopper")
        .step(StepSpec::start("load", |ctx: StepContext| async move {
            ctx.set_state("loaded", true).await;
            Ok::<_, StepError>(StepOutput::new(1))
        }))
        .step(
            StepSpec::listen("decide", TriggerCondition::on("load"), |_ctx: StepContext| async {
                Ok::<_, StepError>(StepOutput::stop())
            })
            .router(),
        )
        .step(StepSpec::listen(
            "after",
            TriggerCondition::on("decide"),
            counting(after.clone()),
        ))
        .build()
        .unwrap();

    let outcome = engine(&flow).run(BTreeMap::new()).await.unwrap();

    assert!(outcome.stopped);
    assert_eq!(after.load(Ordering::SeqCst), 0);
    assert_eq!(outcome.value.get("loaded"), Some(&Value::from(true)));
    assert!(outcome.value.get("id").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_stop_returns_without_waiting_for_siblings() {
    init_tracing();

    let flow = Flow::builder("hung")
        .step(StepSpec::start("kick", constant(1.0)))
        .step(
            StepSpec::listen("router", TriggerCondition::on("kick"), |_ctx: StepContext| async {
                Ok::<_, StepError>(StepOutput::stop())
            })
            .router(),
        )
        .step(StepSpec::listen("slow", TriggerCondition::on("kick"), |_ctx: StepContext| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, StepError>(StepOutput::new(2))
        }))
        .build()
        .unwrap();

    let started = tokio::time::Instant::now();
    let outcome = engine(&flow).run(BTreeMap::new()).await.unwrap();

    assert!(outcome.stopped);
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "run took {:?} after stop",
        started.elapsed()
    );
}

#[tokio::test(start_paused = true)]
async fn test_first_stop_wins_over_delayed_stop() {
    init_tracing();

    let flow = Flow::builder("race")
        .step(StepSpec::start("kick", constant(1.0)))
        .step(
            StepSpec::listen("fast", TriggerCondition::on("kick"), |ctx: StepContext| async move {
                ctx.set_state("winner", "fast").await;
                Ok::<_, StepError>(StepOutput::stop())
            })
            .router(),
        )
        .step(
            StepSpec::listen("late", TriggerCondition::on("kick"), |ctx: StepContext| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                ctx.set_state("winner", "late").await;
                Ok::<_, StepError>(StepOutput::stop())
            })
            .router(),
        )
        .build()
        .unwrap();

    let started = tokio::time::Instant::now();
    let outcome = engine(&flow).run(BTreeMap::new()).await.unwrap();

    assert!(outcome.stopped);
    assert_eq!(outcome.value.get("winner"), Some(&Value::from("fast")));
    assert_eq!(outcome.state.get("winner"), Some(&Value::from("fast")));
    assert!(started.elapsed() < Duration::from_millis(50));
}

#[tokio::test]
async fn test_second_stop_keeps_first_snapshot() {
    init_tracing();

    // Both routers finish in the same fan-out; the later one still writes state
    let router = |label: &'static str| {
        move |ctx: StepContext| async move {
            ctx.set_state("winner", label).await;
            Ok::<_, StepError>(StepOutput::stop())
        }
    };
    let flow = Flow::builder("double-stop")
        .step(StepSpec::start("kick", constant(1.0)))
        .step(StepSpec::listen("first", TriggerCondition::on("kick"), router("first")).router())
        .step(StepSpec::listen("second", TriggerCondition::on("kick"), router("second")).router())
        .build()
        .unwrap();

    let outcome = engine(&flow).run(BTreeMap::new()).await.unwrap();

    assert!(outcome.stopped);
    assert_eq!(outcome.value.get("winner"), Some(&Value::from("first")));
    assert_eq!(outcome.state.get("winner"), Some(&Value::from("second")));
}

#[tokio::test]
async fn test_router_label_triggers_matching_listeners() {
    init_tracing();

    let high = Arc::new(AtomicUsize::new(0));
    let low = Arc::new(AtomicUsize::new(0));
    let flow = Flow::builder("routing")
        .step(
            StepSpec::start("classify", |_ctx: StepContext| async {
                Ok::<_, StepError>(StepOutput::route("high"))
            })
            .router(),
        )
        .step(StepSpec::listen(
            "handle_high",
            TriggerCondition::on("high"),
            counting(high.clone()),
        ))
        .step(StepSpec::listen(
            "handle_low",
            TriggerCondition::on("low"),
            counting(low.clone()),
        ))
        .build()
        .unwrap();

    let outcome = engine(&flow).run(BTreeMap::new()).await.unwrap();

    assert_eq!(high.load(Ordering::SeqCst), 1);
    assert_eq!(low.load(Ordering::SeqCst), 0);
    assert!(!outcome.stopped);
    assert_eq!(outcome.value, Value::from("high"));
}

#[tokio::test]
async fn test_failure_listener_receives_error_message() {
    init_tracing();

    let seen = Arc::new(Mutex::new(None::<Value>));
    let flow = Flow::builder("recovering")
        .step(StepSpec::start("fetch", |_ctx: StepContext| async {
            Err::<StepOutput, _>(StepError::failed("connection refused"))
        }))
        .step(StepSpec::listen("recover", TriggerCondition::failure("fetch"), {
            let seen = seen.clone();
            move |ctx: StepContext| {
                *seen.lock().unwrap() = Some(ctx.input.clone());
                futures::future::ready(Ok::<_, StepError>(StepOutput::new("recovered")))
            }
        }))
        .build()
        .unwrap();

    let outcome = engine(&flow).run(BTreeMap::new()).await.unwrap();

    let input = seen.lock().unwrap().clone().expect("recover ran");
    assert!(input.as_str().unwrap().contains("connection refused"));
    assert_eq!(outcome.failures.len(), 1);
    assert!(outcome.failures[0].handled);
    assert!(outcome.succeeded());
    assert_eq!(outcome.value, Value::from("recovered"));
}

#[tokio::test]
async fn test_unhandled_failure_is_reported() {
    init_tracing();

    let downstream = Arc::new(AtomicUsize::new(0));
    let bus = Arc::new(EventBus::new(100));
    let mut events = bus.subscribe();
    let flow = Flow::builder("failing")
        .step(StepSpec::start("fetch", |_ctx: StepContext| async {
            Err::<StepOutput, _>(StepError::failed("boom"))
        }))
        .step(StepSpec::listen(
            "next",
            TriggerCondition::on("fetch"),
            counting(downstream.clone()),
        ))
        .build()
        .unwrap();

    let outcome = FlowEngine::new(&flow, EngineConfig::default(), bus)
        .unwrap()
        .run(BTreeMap::new())
        .await
        .unwrap();

    assert!(!outcome.succeeded());
    assert_eq!(downstream.load(Ordering::SeqCst), 0);
    assert_eq!(outcome.unhandled_failures().count(), 1);

    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::StepFailed { step, .. } = event {
            assert_eq!(step, "fetch");
            failed = true;
        }
    }
    assert!(failed);
}

#[tokio::test(start_paused = true)]
async fn test_step_timeout_surfaces_as_failure() {
    init_tracing();

    let flow = Flow::builder("slow")
        .step(
            StepSpec::start("sleep", |_ctx: StepContext| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, StepError>(StepOutput::new(1))
            })
            .with_timeout(Duration::from_millis(100)),
        )
        .build()
        .unwrap();

    let outcome = engine(&flow).run(BTreeMap::new()).await.unwrap();

    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].error, StepError::Timeout { millis: 100 });
    assert!(!outcome.succeeded());
}

#[tokio::test]
async fn test_predicate_listener_sees_source_result() {
    init_tracing();

    let big = Arc::new(AtomicUsize::new(0));
    let flow = Flow::builder("predicates")
        .step(StepSpec::start("small", constant(5.0)))
        .step(StepSpec::start("large", constant(50.0)))
        .step(StepSpec::listen(
            "alert",
            TriggerCondition::predicate(|_state: &FlowState, _source: &str, result: &Value| {
                result.as_f64().is_some_and(|v| v > 10.0)
            }),
            counting(big.clone()),
        ))
        .build()
        .unwrap();

    engine(&flow).run(BTreeMap::new()).await.unwrap();

    // alert returns 50 itself but never re-triggers itself
    assert_eq!(big.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_execution_limit_breaks_cycles() {
    init_tracing();

    let flow = Flow::builder("ping-pong")
        .step(StepSpec::start("start", constant(0.0)).no_memo())
        .step(
            StepSpec::listen(
                "ping",
                TriggerCondition::any(["start", "pong"]),
                constant(1.0),
            )
            .no_memo(),
        )
        .step(StepSpec::listen("pong", TriggerCondition::on("ping"), constant(2.0)).no_memo())
        .build()
        .unwrap();
    let config = EngineConfig {
        max_step_executions: 10,
        ..EngineConfig::default()
    };

    let outcome = FlowEngine::new(&flow, config, Arc::new(EventBus::new(100)))
        .unwrap()
        .run(BTreeMap::new())
        .await
        .unwrap();

    assert_eq!(outcome.steps_executed, 10);
    assert_eq!(
        outcome.failures.last().map(|f| f.error.clone()),
        Some(StepError::ExecutionLimit { limit: 10 })
    );
}

#[tokio::test]
async fn test_state_is_restored_from_persistence() {
    init_tracing();

    let store = Arc::new(InMemoryStatePersistence::new());
    let flow = Flow::builder("counter")
        .step(StepSpec::start("bump", |ctx: StepContext| async move {
            let current = ctx
                .state
                .read()
                .await
                .get("count")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            ctx.set_state("count", current + 1.0).await;
            Ok::<_, StepError>(StepOutput::new(current + 1.0))
        }))
        .build()
        .unwrap();

    let first = engine(&flow)
        .with_persistence(store.clone())
        .run(BTreeMap::new())
        .await
        .unwrap();
    let state_id = first.state.id;
    assert_eq!(first.state.get("count"), Some(&Value::from(1)));

    let inputs = BTreeMap::from([("id".to_string(), Value::from(state_id.to_string()))]);
    let second = engine(&flow)
        .with_persistence(store.clone())
        .run(inputs)
        .await
        .unwrap();

    assert_eq!(second.state.id, state_id);
    assert_eq!(second.state.get("count"), Some(&Value::from(2)));
    let saved = store.load_state(state_id).await.unwrap().unwrap();
    assert_eq!(saved.get("count"), Some(&Value::from(2)));
}

#[tokio::test]
async fn test_inputs_are_merged_into_state() {
    init_tracing();

    let flow = Flow::builder("inputs")
        .initial("region", "eu")
        .step(StepSpec::start("read", |ctx: StepContext| async move {
            let user = ctx.require_input("user")?.clone();
            let region = ctx.require_state("region").await?;
            Ok::<_, StepError>(StepOutput::new(Value::Array(vec![user, region])))
        }))
        .build()
        .unwrap();

    let inputs = BTreeMap::from([("user".to_string(), Value::from("ada"))]);
    let outcome = engine(&flow).run(inputs).await.unwrap();

    assert_eq!(
        outcome.value,
        Value::Array(vec![Value::from("ada"), Value::from("eu")])
    );
    assert_eq!(outcome.state.get("user"), Some(&Value::from("ada")));
}

#[tokio::test]
async fn test_unknown_step_is_an_error() {
    init_tracing();

    let flow = Flow::builder("single")
        .step(StepSpec::start("only", constant(1.0)))
        .build()
        .unwrap();

    let err = engine(&flow)
        .execute_step("missing", Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err, StepError::UnknownStep("missing".to_string()));
}
