use std::time::Duration;

use async_trait::async_trait;

/// Application-level liveness check against a sandbox endpoint.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn check(&self, endpoint: &str) -> bool;
}

/// `GET {endpoint}{path}`; healthy only on 200.
pub struct HttpReadinessProbe {
    client: reqwest::Client,
    path: String,
}

impl HttpReadinessProbe {
    pub fn new(path: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            path: path.into(),
        })
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadinessProbe {
    async fn check(&self, endpoint: &str) -> bool {
        let url = format!("{}{}", endpoint.trim_end_matches('/'), self.path);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => true,
            Ok(resp) => {
                tracing::debug!(url = %url, status = %resp.status(), "Sandbox not healthy yet");
                false
            }
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Sandbox health request failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn healthy_on_200_only() {
        let base = serve(
            Router::new()
                .route("/health/ready", get(|| async { "ok" }))
                .route(
                    "/starting/health/ready",
                    get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
                ),
        )
        .await;

        let probe = HttpReadinessProbe::new("/health/ready", Duration::from_secs(3)).unwrap();
        assert!(probe.check(&base).await);
        assert!(probe.check(&format!("{base}/")).await);
        assert!(!probe.check(&format!("{base}/starting")).await);
    }

    #[tokio::test]
    async fn unreachable_is_unhealthy() {
        let probe = HttpReadinessProbe::new("/health/ready", Duration::from_millis(500)).unwrap();
        assert!(!probe.check("http://127.0.0.1:1").await);
    }
}
