use std::time::Duration;

use reqwest::header::AUTHORIZATION;

use crate::credential;

#[derive(serde::Deserialize)]
struct HealthBody {
    healthy: bool,
}

/// Bounded-timeout readiness check against one worker.
///
/// `check` never fails: timeouts, refused connections, non-2xx statuses and
/// malformed bodies all classify the instance as unhealthy. HTTP success
/// alone is not trusted; the body must explicitly report `healthy: true`,
/// because workers answer requests before their internal subsystems are
/// ready. Extra body fields are ignored.
#[derive(Clone)]
pub struct HealthProber {
    client: reqwest::Client,
    timeout: Duration,
}

impl HealthProber {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    pub async fn check(&self, port: u16, secret: &str) -> bool {
        let url = format!("http://127.0.0.1:{port}/health");
        let resp = match self
            .client
            .get(&url)
            .timeout(self.timeout)
            .header(AUTHORIZATION, credential::basic_auth_value(secret))
            .send()
            .await
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        if !resp.status().is_success() {
            return false;
        }

        match resp.json::<HealthBody>().await {
            Ok(body) => body.healthy,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::Json;
    use axum::Router;
    use axum::routing::get;

    async fn serve_health(body: &'static str, status: u16) -> u16 {
        let app = Router::new().route(
            "/health",
            get(move || async move {
                (
                    axum::http::StatusCode::from_u16(status).unwrap(),
                    [("content-type", "application/json")],
                    body,
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn healthy_true_body_is_healthy() {
        let port = serve_health(r#"{"healthy":true}"#, 200).await;
        let prober = HealthProber::new(Duration::from_secs(2));
        assert!(prober.check(port, "s").await);
    }

    #[tokio::test]
    async fn http_200_with_healthy_false_is_unhealthy() {
        let port = serve_health(r#"{"healthy":false}"#, 200).await;
        let prober = HealthProber::new(Duration::from_secs(2));
        assert!(!prober.check(port, "s").await);
    }

    #[tokio::test]
    async fn malformed_body_is_unhealthy() {
        let port = serve_health("ok", 200).await;
        let prober = HealthProber::new(Duration::from_secs(2));
        assert!(!prober.check(port, "s").await);
    }

    #[tokio::test]
    async fn non_2xx_is_unhealthy() {
        let port = serve_health(r#"{"healthy":true}"#, 503).await;
        let prober = HealthProber::new(Duration::from_secs(2));
        assert!(!prober.check(port, "s").await);
    }

    #[tokio::test]
    async fn refused_connection_is_unhealthy() {
        // Bind then drop to find a port nothing listens on.
        let port = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let prober = HealthProber::new(Duration::from_millis(500));
        assert!(!prober.check(port, "s").await);
    }

    #[tokio::test]
    async fn extra_fields_are_ignored() {
        let port = serve_health(r#"{"healthy":true,"version":"1.2.3","uptime_ms":9}"#, 200).await;
        let prober = HealthProber::new(Duration::from_secs(2));
        assert!(prober.check(port, "s").await);
    }
}
