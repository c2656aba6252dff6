use std::sync::Arc;

use reqwest::Method;
use reqwest::header::AUTHORIZATION;

use warden_core::{DestroyReason, PoolError, TenantId, TenantSpec};

use crate::credential;
use crate::registry::{Instance, InstancePool};

/// Relayed worker response. Headers beyond the content type are not
/// preserved; workers speak plain JSON/text APIs.
#[derive(Debug)]
pub struct ProxiedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Forwards tenant requests to their instance, creating it on demand and
/// injecting the instance credential.
#[derive(Clone)]
pub struct RequestProxy {
    pool: Arc<InstancePool>,
    client: reqwest::Client,
}

impl RequestProxy {
    pub fn new(pool: Arc<InstancePool>) -> Self {
        Self {
            pool,
            client: reqwest::Client::new(),
        }
    }

    /// Relays one request. A connect failure against a believed-healthy
    /// instance (the instance may have been reaped between resolution and
    /// dispatch) destroys it and retries exactly once after a fresh
    /// get-or-create; persistent failures are not masked by further
    /// retries.
    pub async fn forward(
        &self,
        tenant: &TenantId,
        spec: &TenantSpec,
        method: Method,
        path: &str,
        body: Vec<u8>,
    ) -> Result<ProxiedResponse, PoolError> {
        let inst = self.pool.get_or_create(tenant, spec).await?;
        match self.relay(&inst, method.clone(), path, body.clone()).await {
            Ok(resp) => Ok(resp),
            Err(PoolError::ProxyUnreachable(reason)) => {
                tracing::warn!(tenant = %tenant, %reason, "instance unreachable, retrying once");
                // Destroy the instance that failed, not whatever is
                // current; a racing replacement survives the identity
                // check inside destroy.
                self.pool
                    .destroy_instance(&inst, DestroyReason::Unhealthy)
                    .await;
                let fresh = self.pool.get_or_create(tenant, spec).await?;
                self.relay(&fresh, method, path, body).await
            }
            Err(e) => Err(e),
        }
    }

    async fn relay(
        &self,
        inst: &Arc<Instance>,
        method: Method,
        path: &str,
        body: Vec<u8>,
    ) -> Result<ProxiedResponse, PoolError> {
        let path = path.strip_prefix('/').unwrap_or(path);
        let url = format!("http://127.0.0.1:{}/{path}", inst.port());

        let resp = self
            .client
            .request(method, &url)
            .header(AUTHORIZATION, credential::basic_auth_value(inst.credential()))
            .body(body)
            .send()
            .await
            .map_err(|e| PoolError::ProxyUnreachable(e.to_string()))?;

        inst.touch();

        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let body = resp
            .bytes()
            .await
            .map_err(|e| PoolError::ProxyUnreachable(e.to_string()))?
            .to_vec();

        Ok(ProxiedResponse {
            status,
            content_type,
            body,
        })
    }
}
