#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use conductor_core::*;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// 1. Task serialization roundtrip keeps optional fields
// ---------------------------------------------------------------------------

#[test]
fn task_serialization_roundtrip() {
    let task = Task::new("writer", "draft", serde_json::json!({"topic": "rust"})).with_priority(9);

    let json = serde_json::to_string(&task).unwrap();
    let parsed: Task = serde_json::from_str(&json).unwrap();

    assert_eq!(parsed.id, task.id);
    assert_eq!(parsed.agent_id, "writer");
    assert_eq!(parsed.priority, Some(9));
    assert_eq!(parsed.timeout_ms, None);
    assert_eq!(parsed.status, TaskStatus::Pending);
    assert!(json.contains("\"pending\""));
}

// ---------------------------------------------------------------------------
// 2. Error Display and From impls
// ---------------------------------------------------------------------------

#[test]
fn error_display_and_from_impls() {
    let capacity = ConductorError::Capacity("queue full".to_string());
    assert_eq!(capacity.to_string(), "Capacity error: queue full");
    assert_eq!(capacity.kind(), "capacity");

    let timeout = ConductorError::Timeout("init".to_string());
    assert_eq!(timeout.to_string(), "Timeout: init");

    let json_err: ConductorError = serde_json::from_str::<Task>("{").unwrap_err().into();
    assert!(matches!(json_err, ConductorError::Json(_)));
    assert_eq!(json_err.kind(), "json");

    let io_err: ConductorError = std::io::Error::other("disk").into();
    assert!(io_err.to_string().starts_with("IO error"));
}

// ---------------------------------------------------------------------------
// 3. Collaborators can be used behind trait objects
// ---------------------------------------------------------------------------

struct Doubler;

#[async_trait]
impl Agent for Doubler {
    fn agent_type(&self) -> &str {
        "math"
    }

    async fn execute_task(&self, task: &Task) -> ConductorResult<serde_json::Value> {
        let n = task
            .payload
            .as_i64()
            .ok_or_else(|| ConductorError::Execution("payload is not a number".into()))?;
        Ok(serde_json::json!(n * 2))
    }
}

#[tokio::test]
async fn registry_resolves_trait_objects() {
    let registry: Arc<dyn AgentRegistry> = {
        let registry = InMemoryAgentRegistry::new();
        registry.register("doubler", Arc::new(Doubler)).await;
        Arc::new(registry)
    };

    let agent = registry.get_agent("doubler").await.unwrap();
    assert_eq!(agent.agent_type(), "math");

    let ok = agent
        .execute_task(&Task::new("doubler", "double", serde_json::json!(21)))
        .await
        .unwrap();
    assert_eq!(ok, serde_json::json!(42));

    let err = agent
        .execute_task(&Task::new("doubler", "double", serde_json::json!("x")))
        .await
        .unwrap_err();
    assert!(matches!(err, ConductorError::Execution(_)));
}

#[tokio::test]
async fn monitoring_is_shared_between_trait_views() {
    let monitoring = Arc::new(InMemoryMonitoring::new());
    let metrics: Arc<dyn MonitoringService> = monitoring.clone();
    let alerts: Arc<dyn AlertManager> = monitoring.clone();

    metrics
        .record_metric("a", Metric::new("uptime", 1500.0, "ms").with_meta("phase", "shutdown"))
        .await;
    let id = alerts
        .create_alert(Alert::new(AlertSeverity::Critical, "stuck"))
        .await;

    assert_eq!(monitoring.metrics_named("a", "uptime").await.len(), 1);
    assert_eq!(monitoring.alerts().await[0].id, id);
}

#[tokio::test]
async fn tracing_error_handler_accepts_context() {
    let handler = TracingErrorHandler;
    let ctx = ErrorContext::new("a", "TaskQueue", "execute_task").with_correlation(7);
    assert_eq!(ctx.correlation_id.as_deref(), Some("7"));
    handler
        .handle_error(&ConductorError::Execution("boom".into()), ctx)
        .await;
}
