//! Third-party verification fallback, consulted only after local probing
//! settles on temp_fail/unknown.

use common_store::FallbackStatus;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

pub struct FallbackClient {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FallbackResponse {
    status: String,
}

impl FallbackClient {
    pub fn new(url: String, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self { client, url, api_key })
    }

    /// Provider errors and unrecognized statuses degrade to `unknown`;
    /// the fallback can only ever refine a verdict, not block one.
    pub async fn check(&self, email: &str) -> FallbackStatus {
        let mut request = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "email": email }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<FallbackResponse>().await {
                    Ok(body) => match body.status.to_lowercase().as_str() {
                        "deliverable" | "valid" => FallbackStatus::Deliverable,
                        "undeliverable" | "invalid" => FallbackStatus::Undeliverable,
                        other => {
                            warn!(status = other, "unrecognized fallback status");
                            FallbackStatus::Unknown
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "undecodable fallback response");
                        FallbackStatus::Unknown
                    }
                }
            }
            Ok(response) => {
                warn!(status = %response.status(), "fallback provider error");
                FallbackStatus::Unknown
            }
            Err(e) => {
                warn!(error = %e, "fallback provider unreachable");
                FallbackStatus::Unknown
            }
        }
    }
}
