use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A single measurement reported by an engine component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    /// Metric name, e.g. `task_duration`.
    pub name: String,
    /// Measured value.
    pub value: f64,
    /// Unit of `value`, e.g. `ms` or `count`.
    pub unit: String,
    /// Time of measurement.
    pub timestamp: DateTime<Utc>,
    /// Free-form labels.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Metric {
    /// Metric timestamped now.
    pub fn new(name: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            unit: unit.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Counter-style metric with value 1.
    pub fn count(name: impl Into<String>) -> Self {
        Self::new(name, 1.0, "count")
    }

    /// Attach a label.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational.
    Low,
    /// Needs attention.
    Medium,
    /// Agent-level failure.
    High,
    /// System-level failure.
    Critical,
}

/// An alert raised through the [`AlertManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// How urgent the alert is.
    pub severity: AlertSeverity,
    /// Human-readable description.
    pub message: String,
    /// Free-form labels such as `agent_id` and `component`.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Alert {
    /// Alert without metadata.
    pub fn new(severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            metadata: HashMap::new(),
        }
    }

    /// Attach a label.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Metric sink supplied by the host application.
#[async_trait]
pub trait MonitoringService: Send + Sync {
    /// Record a metric against an agent.
    async fn record_metric(&self, agent_id: &str, metric: Metric);
}

/// Alert sink supplied by the host application.
#[async_trait]
pub trait AlertManager: Send + Sync {
    /// Raise an alert and return its id.
    async fn create_alert(&self, alert: Alert) -> String;
    /// Resolve a previously raised alert. Returns `false` for unknown ids.
    async fn resolve_alert(&self, alert_id: &str) -> bool;
}

/// An alert as stored by [`InMemoryMonitoring`].
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    /// Id returned by [`AlertManager::create_alert`].
    pub id: String,
    /// The alert as raised.
    pub alert: Alert,
    /// Time it was raised.
    pub created_at: DateTime<Utc>,
    /// Whether it has been resolved.
    pub resolved: bool,
}

/// Keeps every metric and alert in memory. Useful for tests and embedding.
pub struct InMemoryMonitoring {
    metrics: RwLock<HashMap<String, Vec<Metric>>>,
    alerts: RwLock<Vec<AlertRecord>>,
}

impl InMemoryMonitoring {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
            alerts: RwLock::new(Vec::new()),
        }
    }

    /// All metrics recorded for an agent, oldest first.
    pub async fn metrics_for(&self, agent_id: &str) -> Vec<Metric> {
        self.metrics
            .read()
            .await
            .get(agent_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Metrics with the given name recorded for an agent.
    pub async fn metrics_named(&self, agent_id: &str, name: &str) -> Vec<Metric> {
        self.metrics_for(agent_id)
            .await
            .into_iter()
            .filter(|m| m.name == name)
            .collect()
    }

    /// Every alert raised so far, oldest first.
    pub async fn alerts(&self) -> Vec<AlertRecord> {
        self.alerts.read().await.clone()
    }

    /// Alerts not yet resolved.
    pub async fn open_alerts(&self) -> Vec<AlertRecord> {
        self.alerts
            .read()
            .await
            .iter()
            .filter(|a| !a.resolved)
            .cloned()
            .collect()
    }
}

impl Default for InMemoryMonitoring {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MonitoringService for InMemoryMonitoring {
    async fn record_metric(&self, agent_id: &str, metric: Metric) {
        self.metrics
            .write()
            .await
            .entry(agent_id.to_string())
            .or_default()
            .push(metric);
    }
}

#[async_trait]
impl AlertManager for InMemoryMonitoring {
    async fn create_alert(&self, alert: Alert) -> String {
        let id = Uuid::new_v4().to_string();
        self.alerts.write().await.push(AlertRecord {
            id: id.clone(),
            alert,
            created_at: Utc::now(),
            resolved: false,
        });
        id
    }

    async fn resolve_alert(&self, alert_id: &str) -> bool {
        let mut alerts = self.alerts.write().await;
        match alerts.iter_mut().find(|a| a.id == alert_id && !a.resolved) {
            Some(record) => {
                record.resolved = true;
                true
            }
            None => false,
        }
    }
}
