use std::collections::BTreeMap;
use std::path::PathBuf;

/// Verified tenant identity, supplied by the authentication layer.
///
/// NOTE: This is opaque to the pool. The pool never parses or derives
/// anything from it beyond using it as a map key and a directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct TenantId(pub String);

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Instance lifecycle. Transitions are one-way: an instance never returns
/// from `Stopped` or `Failed` to `Running`; a fresh instance replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InstanceState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Per-tenant worker parameters, supplied by the collaborators that own
/// storage layout and resource policy. Limits are passed through to the
/// worker environment, not enforced here.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TenantSpec {
    pub working_dir: Option<PathBuf>,
    pub memory_limit_mb: Option<u64>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Sanitized snapshot of one instance for administrative display.
/// The credential is deliberately absent.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstanceStatus {
    pub id: InstanceId,
    pub tenant: TenantId,
    pub port: u16,
    pub state: InstanceState,
    pub pid: Option<u32>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub idle_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PoolStats {
    pub instances: usize,
    pub running: usize,
    pub ports_leased: usize,
    pub ports_free: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestroyReason {
    Unhealthy,
    Idle,
    Replaced,
    Requested,
    /// The worker finished on its own with a zero exit.
    Exited,
}

/// Lifecycle events fanned out to external subscribers.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    Created {
        tenant: TenantId,
        instance: InstanceId,
        port: u16,
    },
    Destroyed {
        tenant: TenantId,
        instance: InstanceId,
        reason: DestroyReason,
    },
    Error {
        tenant: TenantId,
        instance: InstanceId,
        message: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no free ports in range {start}..={end}")]
    NoPortsAvailable { start: u16, end: u16 },

    #[error("failed to spawn worker")]
    SpawnFailure(#[from] std::io::Error),

    #[error("worker exited during startup with code {code:?}")]
    WorkerExited { code: Option<i32> },

    #[error("worker did not become healthy within {waited_ms}ms")]
    HealthTimeout { waited_ms: u64 },

    #[error("worker unreachable: {0}")]
    ProxyUnreachable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_is_non_empty() {
        let id = InstanceId::new();
        assert!(!id.0.is_empty());
    }

    #[test]
    fn instance_ids_are_unique() {
        assert_ne!(InstanceId::new(), InstanceId::new());
    }

    #[test]
    fn status_serializes_without_credential_field() {
        let status = InstanceStatus {
            id: InstanceId::new(),
            tenant: TenantId("acme".to_string()),
            port: 41000,
            state: InstanceState::Running,
            pid: Some(4242),
            created_at: chrono::Utc::now(),
            idle_ms: 125,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"tenant\":\"acme\""));
        assert!(!json.contains("credential"));
    }

    #[test]
    fn pool_error_messages_name_the_range() {
        let err = PoolError::NoPortsAvailable {
            start: 41000,
            end: 41002,
        };
        assert_eq!(err.to_string(), "no free ports in range 41000..=41002");
    }

    #[test]
    fn events_tag_their_kind() {
        let ev = PoolEvent::Destroyed {
            tenant: TenantId("acme".to_string()),
            instance: InstanceId::new(),
            reason: DestroyReason::Idle,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"event\":\"destroyed\""));
        assert!(json.contains("\"reason\":\"idle\""));
    }
}
