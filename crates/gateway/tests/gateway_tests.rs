use std::future::{ready, Ready};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskpilot_core::{
    config::GatewayConfig,
    models::{Endpoint, EndpointStatus},
    traits::StateRepository,
    SchedulerError, SchedulerResult,
};
use taskpilot_gateway::{EndpointGateway, SelectionStrategy};
use taskpilot_infrastructure::InMemoryStateRepository;
use taskpilot_testing_utils::EndpointConfigBuilder;

fn test_config() -> GatewayConfig {
    GatewayConfig {
        cooldown_seconds: 1,
        max_wait_ms: 10,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        ..GatewayConfig::default()
    }
}

async fn gateway_with(endpoints: &[(&str, u32)]) -> EndpointGateway {
    let mut config = test_config();
    config.endpoints = endpoints
        .iter()
        .map(|(name, priority)| EndpointConfigBuilder::new(name).with_priority(*priority).build())
        .collect();
    EndpointGateway::from_config(&config, None).await.unwrap()
}

/// 对 `failing` 中的端点返回错误，其余端点返回端点名
fn respond(
    failing: &[&str],
    calls: Arc<Mutex<Vec<String>>>,
) -> impl Fn(Endpoint) -> Ready<SchedulerResult<String>> {
    let failing: Vec<String> = failing.iter().map(|s| s.to_string()).collect();
    move |endpoint: Endpoint| {
        calls.lock().unwrap().push(endpoint.name.clone());
        ready(if failing.contains(&endpoint.name) {
            Err(SchedulerError::Network(format!("{} returned 502", endpoint.name)))
        } else {
            Ok(endpoint.name.clone())
        })
    }
}

#[tokio::test]
async fn test_failed_endpoint_is_skipped_until_cooldown_then_probed() {
    let gateway = gateway_with(&[("primary", 1), ("secondary", 2)]).await;
    let calls = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..3 {
        let err = gateway
            .call_with_retry(respond(&["primary"], calls.clone()), 0, SelectionStrategy::Priority)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::AllAttemptsExhausted { attempts: 1, .. }));
    }
    assert_eq!(
        gateway.registry().status("primary").await,
        Some(EndpointStatus::Failed)
    );

    for _ in 0..3 {
        let endpoint = gateway.select(SelectionStrategy::Priority).await.unwrap();
        assert_eq!(endpoint.name, "secondary");
    }

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let (value, endpoint) = gateway
        .call_with_retry(respond(&[], calls.clone()), 0, SelectionStrategy::Priority)
        .await
        .unwrap();
    assert_eq!(value, "primary");
    assert_eq!(endpoint.name, "primary");
    assert_eq!(
        gateway.registry().status("primary").await,
        Some(EndpointStatus::Active)
    );
}

#[tokio::test]
async fn test_select_does_not_take_the_probe_slot() {
    let gateway = gateway_with(&[("primary", 1), ("secondary", 2)]).await;
    let calls = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..3 {
        let _ = gateway
            .call_with_retry(respond(&["primary"], calls.clone()), 0, SelectionStrategy::Priority)
            .await;
    }
    tokio::time::sleep(Duration::from_millis(1100)).await;

    for _ in 0..2 {
        let endpoint = gateway.select(SelectionStrategy::Priority).await.unwrap();
        assert_eq!(endpoint.name, "primary");
    }
    let health = gateway.registry().health("primary").await.unwrap();
    assert!(health.probe_started_at.is_none());

    let (_, endpoint) = gateway
        .call_with_retry(respond(&[], calls.clone()), 0, SelectionStrategy::Priority)
        .await
        .unwrap();
    assert_eq!(endpoint.name, "primary");
    assert_eq!(
        gateway.registry().status("primary").await,
        Some(EndpointStatus::Active)
    );
}

#[tokio::test]
async fn test_rate_limited_probe_is_released() {
    let mut config = test_config();
    config.endpoints = vec![
        EndpointConfigBuilder::new("scarce")
            .with_priority(1)
            .with_rate_limit(3)
            .build(),
        EndpointConfigBuilder::new("plenty").with_priority(2).build(),
    ];
    let gateway = EndpointGateway::from_config(&config, None).await.unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));

    // 三次失败耗尽令牌并使端点进入 Failed
    for _ in 0..3 {
        let _ = gateway
            .call_with_retry(respond(&["scarce"], calls.clone()), 0, SelectionStrategy::Priority)
            .await;
    }
    assert_eq!(
        gateway.registry().status("scarce").await,
        Some(EndpointStatus::Failed)
    );
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let (_, endpoint) = gateway
        .call_with_retry(respond(&[], calls.clone()), 0, SelectionStrategy::Priority)
        .await
        .unwrap();
    assert_eq!(endpoint.name, "plenty");

    let health = gateway.registry().health("scarce").await.unwrap();
    assert!(health.probe_started_at.is_none());
    assert_eq!(health.status, EndpointStatus::Failed);

    let err = gateway
        .call_endpoint("scarce", respond(&[], calls.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::NoEndpointAvailable));
    let health = gateway.registry().health("scarce").await.unwrap();
    assert!(health.probe_started_at.is_none());
}

#[tokio::test]
async fn test_retry_moves_to_healthy_endpoint() {
    let gateway = gateway_with(&[("primary", 1), ("secondary", 2)]).await;
    let calls = Arc::new(Mutex::new(Vec::new()));

    let (value, endpoint) = gateway
        .call_with_retry(respond(&["primary"], calls.clone()), 2, SelectionStrategy::Priority)
        .await
        .unwrap();

    assert_eq!(value, "secondary");
    assert_eq!(endpoint.name, "secondary");
    assert_eq!(*calls.lock().unwrap(), vec!["primary", "secondary"]);
}

#[tokio::test]
async fn test_exhausted_attempts_report_last_error() {
    let gateway = gateway_with(&[("only", 1)]).await;
    let calls = Arc::new(Mutex::new(Vec::new()));

    let err = gateway
        .call_with_retry(respond(&["only"], calls.clone()), 2, SelectionStrategy::Priority)
        .await
        .unwrap_err();

    match err {
        SchedulerError::AllAttemptsExhausted {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("502"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(calls.lock().unwrap().len(), 3);
    assert_eq!(gateway.registry().status("only").await, Some(EndpointStatus::Failed));
}

#[tokio::test]
async fn test_no_endpoint_available() {
    let gateway = gateway_with(&[]).await;
    let calls = Arc::new(Mutex::new(Vec::new()));
    let err = gateway
        .call_with_retry(respond(&[], calls.clone()), 2, SelectionStrategy::Random)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::NoEndpointAvailable));
    assert!(calls.lock().unwrap().is_empty());

    let gateway = gateway_with(&[("a", 1)]).await;
    gateway
        .set_override("a", Some(EndpointStatus::Failed))
        .await
        .unwrap();
    assert!(matches!(
        gateway.select(SelectionStrategy::Priority).await,
        Err(SchedulerError::NoEndpointAvailable)
    ));
}

#[tokio::test]
async fn test_degraded_endpoint_is_only_a_fallback() {
    let gateway = gateway_with(&[("primary", 1), ("secondary", 2)]).await;
    gateway
        .set_override("primary", Some(EndpointStatus::Degraded))
        .await
        .unwrap();
    assert_eq!(
        gateway.select(SelectionStrategy::Priority).await.unwrap().name,
        "secondary"
    );

    gateway
        .set_override("secondary", Some(EndpointStatus::Failed))
        .await
        .unwrap();
    assert_eq!(
        gateway.select(SelectionStrategy::Priority).await.unwrap().name,
        "primary"
    );

    gateway.set_override("primary", None).await.unwrap();
    let snapshot = gateway.snapshot().await;
    assert_eq!(snapshot[0].name, "primary");
    assert_eq!(snapshot[0].status, EndpointStatus::Active);
    assert_eq!(snapshot[1].override_status, Some(EndpointStatus::Failed));
}

#[tokio::test]
async fn test_rate_limited_endpoint_hands_over_to_next_candidate() {
    let mut config = test_config();
    config.endpoints = vec![
        EndpointConfigBuilder::new("scarce")
            .with_priority(1)
            .with_rate_limit(1)
            .build(),
        EndpointConfigBuilder::new("plenty").with_priority(2).build(),
    ];
    let gateway = EndpointGateway::from_config(&config, None).await.unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let (_, first) = gateway
        .call_with_retry(respond(&[], calls.clone()), 0, SelectionStrategy::Priority)
        .await
        .unwrap();
    let (_, second) = gateway
        .call_with_retry(respond(&[], calls.clone()), 0, SelectionStrategy::Priority)
        .await
        .unwrap();

    assert_eq!(first.name, "scarce");
    assert_eq!(second.name, "plenty");
    assert_eq!(
        gateway.registry().status("scarce").await,
        Some(EndpointStatus::RateLimited)
    );
}

#[tokio::test]
async fn test_round_robin_spreads_calls() {
    let gateway = gateway_with(&[("a", 1), ("b", 1)]).await;
    let calls = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..4 {
        gateway
            .call_with_retry(respond(&[], calls.clone()), 0, SelectionStrategy::RoundRobin)
            .await
            .unwrap();
    }
    let calls = calls.lock().unwrap();
    assert_eq!(calls.iter().filter(|n| n.as_str() == "a").count(), 2);
    assert_eq!(calls.iter().filter(|n| n.as_str() == "b").count(), 2);
}

#[tokio::test]
async fn test_slow_call_counts_as_failure() {
    let mut config = test_config();
    config.endpoints = vec![EndpointConfigBuilder::new("slow").with_timeout(1).build()];
    let gateway = EndpointGateway::from_config(&config, None).await.unwrap();

    let err = gateway
        .call_with_retry(
            |_endpoint: Endpoint| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                Ok::<_, SchedulerError>(())
            },
            0,
            SelectionStrategy::Priority,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SchedulerError::AllAttemptsExhausted { .. }));
    let snapshot = gateway.snapshot().await;
    assert_eq!(snapshot[0].failure_count, 1);
}

#[tokio::test]
async fn test_validation_errors_are_not_retried() {
    let gateway = gateway_with(&[("a", 1), ("b", 2)]).await;
    let err = gateway
        .call_with_retry(
            |_endpoint: Endpoint| ready(Err::<(), _>(SchedulerError::Validation("bad prompt".into()))),
            3,
            SelectionStrategy::Priority,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(_)));
    assert!(gateway.snapshot().await.iter().all(|s| s.failure_count == 0));
}

#[tokio::test]
async fn test_pinned_call_and_endpoint_management() {
    let gateway = gateway_with(&[("a", 1)]).await;
    gateway
        .add_endpoint(EndpointConfigBuilder::new("b").with_priority(5).build())
        .await
        .unwrap();

    let calls = Arc::new(Mutex::new(Vec::new()));
    let value = gateway
        .call_endpoint("b", respond(&[], calls.clone()))
        .await
        .unwrap();
    assert_eq!(value, "b");
    assert!(matches!(
        gateway.call_endpoint("missing", respond(&[], calls.clone())).await,
        Err(SchedulerError::EndpointNotFound { .. })
    ));

    assert!(gateway.remove_endpoint("b").await.unwrap());
    assert_eq!(gateway.registry().names().await, vec!["a".to_string()]);

    gateway
        .call_with_retry(respond(&["a"], calls.clone()), 0, SelectionStrategy::Priority)
        .await
        .unwrap_err();
    gateway.reset_stats(None).await.unwrap();
    assert_eq!(gateway.snapshot().await[0].failure_count, 0);
}

#[tokio::test]
async fn test_endpoint_health_survives_restart() {
    let state: Arc<dyn StateRepository> = Arc::new(InMemoryStateRepository::new());
    let mut config = test_config();
    config.cooldown_seconds = 300;
    config.endpoints = vec![EndpointConfigBuilder::new("flaky").build()];

    let gateway = EndpointGateway::from_config(&config, Some(state.clone()))
        .await
        .unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..3 {
        let _ = gateway
            .call_with_retry(respond(&["flaky"], calls.clone()), 0, SelectionStrategy::Priority)
            .await;
    }

    let restarted = EndpointGateway::from_config(&config, Some(state.clone()))
        .await
        .unwrap();
    let snapshot = restarted.snapshot().await;
    assert_eq!(snapshot[0].status, EndpointStatus::Failed);
    assert_eq!(snapshot[0].failure_count, 3);
    assert!(snapshot[0].cooldown_remaining_seconds > 0);
}
