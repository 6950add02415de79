//! HTTP delivery to a gorush gateway.

use std::time::Duration;

use async_trait::async_trait;
use orchestra_core::config::{NotifyConfig, PUSH_PATH};
use reqwest::{StatusCode, Url};
use tracing::{debug, warn};

use crate::error::NotifyError;
use crate::notifier::Notifier;
use crate::payload::{GorushRequest, PushPayload, PushSettings, PushTarget};

/// Upper bound for the delay between two attempts at the same push.
const RETRY_MAX_MS: u64 = 30_000;

/// Sends one notification per request to `<gorush_url>/api/push`.
///
/// Every request carries the configured timeout so a stuck gateway cannot
/// hold a job's run lock forever. Retryable failures are retried up to
/// `max_attempts` times with exponential backoff.
pub struct GorushDispatcher {
    client: reqwest::Client,
    push_url: Url,
    basic_auth: Option<(String, Option<String>)>,
    settings: PushSettings,
    max_attempts: u32,
    retry_base: Duration,
}

impl GorushDispatcher {
    pub fn from_config(config: &NotifyConfig) -> Result<Self, NotifyError> {
        let base = config
            .gorush_url
            .as_deref()
            .ok_or(NotifyError::MissingConfig("notify.gorush_url"))?;
        let push_url = Url::parse(base)
            .and_then(|u| u.join(PUSH_PATH))
            .map_err(|e| NotifyError::InvalidUrl(format!("{base}: {e}")))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;

        let basic_auth = config
            .basic_auth_user
            .clone()
            .map(|user| (user, config.basic_auth_password.clone()));

        Ok(Self {
            client,
            push_url,
            basic_auth,
            settings: PushSettings::from(config),
            max_attempts: config.max_attempts.max(1),
            retry_base: Duration::from_millis(config.retry_base_ms),
        })
    }

    pub fn push_url(&self) -> &Url {
        &self.push_url
    }

    /// POST one batch. Success is exactly HTTP 200.
    pub async fn push(&self, request: &GorushRequest) -> Result<(), NotifyError> {
        let mut req = self.client.post(self.push_url.clone()).json(request);
        if let Some((user, password)) = &self.basic_auth {
            req = req.basic_auth(user, password.as_deref());
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body,
            });
        }
        debug!(url = %self.push_url, count = request.notifications.len(), "gateway accepted push");
        Ok(())
    }

    async fn push_with_retry(
        &self,
        request: &GorushRequest,
        target: &PushTarget,
    ) -> Result<(), NotifyError> {
        let mut delay = self.retry_base;
        let mut attempt = 1;
        loop {
            match self.push(request).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        probe_id = %target.probe_id,
                        attempt,
                        max = self.max_attempts,
                        error = %e,
                        retry_after_ms = delay.as_millis() as u64,
                        "push failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_millis(RETRY_MAX_MS));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl Notifier for GorushDispatcher {
    async fn notify(&self, target: &PushTarget, payload: &PushPayload) -> Result<(), NotifyError> {
        let notification = self.settings.build(target, payload)?;
        let request = GorushRequest {
            notifications: vec![notification],
        };
        self.push_with_retry(&request, target).await
    }

    fn name(&self) -> &str {
        "gorush"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
    use orchestra_core::{Platform, ProbeId};
    use serde_json::Value;

    #[derive(Default)]
    struct Gateway {
        /// Statuses to answer with, in order; the last one repeats.
        statuses: Mutex<Vec<u16>>,
        bodies: Mutex<Vec<Value>>,
        auth: Mutex<Vec<Option<String>>>,
    }

    async fn push_handler(
        State(gw): State<Arc<Gateway>>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> StatusCode {
        gw.bodies.lock().unwrap().push(body);
        gw.auth.lock().unwrap().push(
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(String::from),
        );
        let mut statuses = gw.statuses.lock().unwrap();
        let code = if statuses.len() > 1 {
            statuses.remove(0)
        } else {
            statuses.first().copied().unwrap_or(200)
        };
        StatusCode::from_u16(code).unwrap()
    }

    async fn spawn_gateway(statuses: Vec<u16>) -> (String, Arc<Gateway>) {
        let gw = Arc::new(Gateway {
            statuses: Mutex::new(statuses),
            ..Default::default()
        });
        let app = Router::new()
            .route("/api/push", post(push_handler))
            .with_state(Arc::clone(&gw));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), gw)
    }

    fn config(url: &str) -> NotifyConfig {
        NotifyConfig {
            gorush_url: Some(url.to_string()),
            ios_topic: Some("org.example.probe".into()),
            android_click_action: Some("org.example.OPEN".into()),
            retry_base_ms: 10,
            ..Default::default()
        }
    }

    fn target(platform: &str) -> PushTarget {
        PushTarget {
            probe_id: ProbeId::from("p-1"),
            token: "device-token".into(),
            platform: Platform::from(platform),
        }
    }

    fn alert() -> PushPayload {
        PushPayload::Alert {
            message: "maintenance tonight".into(),
            extra: Default::default(),
        }
    }

    #[test]
    fn push_url_is_resolved_against_base() {
        let d = GorushDispatcher::from_config(&config("http://gw.local:8088/ignored")).unwrap();
        assert_eq!(d.push_url().as_str(), "http://gw.local:8088/api/push");
    }

    #[test]
    fn missing_url_is_a_config_error() {
        let err = GorushDispatcher::from_config(&NotifyConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, NotifyError::MissingConfig("notify.gorush_url")));
    }

    #[tokio::test]
    async fn successful_push_posts_single_notification() {
        let (url, gw) = spawn_gateway(vec![200]).await;
        let d = GorushDispatcher::from_config(&config(&url)).unwrap();

        d.notify(&target("ios"), &alert()).await.unwrap();

        let bodies = gw.bodies.lock().unwrap();
        assert_eq!(bodies.len(), 1);
        let n = &bodies[0]["notifications"][0];
        assert_eq!(n["tokens"][0], "device-token");
        assert_eq!(n["platform"], 1);
        assert_eq!(n["topic"], "org.example.probe");
        assert_eq!(n["message"], "maintenance tonight");
        assert_eq!(gw.auth.lock().unwrap()[0], None);
    }

    #[tokio::test]
    async fn basic_auth_is_sent_when_configured() {
        let (url, gw) = spawn_gateway(vec![200]).await;
        let mut cfg = config(&url);
        cfg.basic_auth_user = Some("orchestra".into());
        cfg.basic_auth_password = Some("s3cret".into());
        let d = GorushDispatcher::from_config(&cfg).unwrap();

        d.notify(&target("android"), &alert()).await.unwrap();

        let auth = gw.auth.lock().unwrap()[0].clone().unwrap();
        // base64("orchestra:s3cret")
        assert_eq!(auth, "Basic b3JjaGVzdHJhOnMzY3JldA==");
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_success() {
        let (url, gw) = spawn_gateway(vec![503, 500, 200]).await;
        let d = GorushDispatcher::from_config(&config(&url)).unwrap();

        d.notify(&target("ios"), &alert()).await.unwrap();
        assert_eq!(gw.bodies.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let (url, gw) = spawn_gateway(vec![500]).await;
        let d = GorushDispatcher::from_config(&config(&url)).unwrap();

        let err = d.notify(&target("ios"), &alert()).await.unwrap_err();
        assert!(matches!(err, NotifyError::Status { status: 500, .. }));
        assert_eq!(gw.bodies.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn non_200_success_codes_are_failures() {
        let (url, gw) = spawn_gateway(vec![202]).await;
        let d = GorushDispatcher::from_config(&config(&url)).unwrap();

        let err = d.notify(&target("ios"), &alert()).await.unwrap_err();
        assert!(matches!(err, NotifyError::Status { status: 202, .. }));
        assert_eq!(gw.bodies.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unsupported_platform_never_reaches_gateway() {
        let (url, gw) = spawn_gateway(vec![200]).await;
        let d = GorushDispatcher::from_config(&config(&url)).unwrap();

        let err = d.notify(&target("windows"), &alert()).await.unwrap_err();
        assert!(matches!(err, NotifyError::UnsupportedPlatform { .. }));
        assert!(gw.bodies.lock().unwrap().is_empty());
    }
}
