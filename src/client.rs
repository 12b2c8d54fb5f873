//! HTTP client for a running parallizer server
//!
//! Used by `parallizer-watch`: trigger once, then poll on the server's
//! advertised interval until the background run is done.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::http::{ClearResponse, PollResponse, TriggerBody, TriggerResponse, UserBody};

const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 3;

#[derive(Clone, Debug)]
pub struct FeedClient {
    base_url: String,
    token: Option<String>,
    client: Client,
}

impl FeedClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder, what: &str) -> Result<T> {
        let resp = self
            .authorize(req)
            .send()
            .await
            .with_context(|| format!("{what} request failed"))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read response body".to_string());
            anyhow::bail!("{what} returned {status}: {text}");
        }
        resp.json::<T>()
            .await
            .with_context(|| format!("{what} response was not valid JSON"))
    }

    pub async fn trigger(&self, body: &TriggerBody) -> Result<TriggerResponse> {
        self.send(self.client.post(self.url("/trigger")).json(body), "trigger")
            .await
    }

    pub async fn poll(&self, user_id: &str) -> Result<PollResponse> {
        let body = UserBody {
            user_id: user_id.to_string(),
        };
        self.send(self.client.post(self.url("/poll")).json(&body), "poll")
            .await
    }

    pub async fn clear(&self, user_id: &str) -> Result<ClearResponse> {
        let body = UserBody {
            user_id: user_id.to_string(),
        };
        self.send(self.client.post(self.url("/clear")).json(&body), "clear")
            .await
    }

    pub async fn health(&self) -> Result<Value> {
        self.send(self.client.get(self.url("/health")), "health")
            .await
    }

    /// Poll interval advertised by the server, or the default when unreachable
    pub async fn poll_interval(&self) -> Duration {
        let seconds = match self.health().await {
            Ok(health) => poll_interval_from_health(&health),
            Err(e) => {
                tracing::debug!(error = %e, "health unavailable; using default poll interval");
                DEFAULT_POLL_INTERVAL_SECONDS
            }
        };
        Duration::from_secs(seconds)
    }

    /// Trigger, then poll until `processing` is false or `max_polls` is reached.
    ///
    /// `on_update` sees the trigger snapshot and every poll result.
    pub async fn watch<F>(&self, body: &TriggerBody, max_polls: u32, mut on_update: F) -> Result<PollResponse>
    where
        F: FnMut(&PollResponse),
    {
        let interval = self.poll_interval().await;
        let triggered = self.trigger(body).await?;
        let mut latest = PollResponse {
            cards: triggered.cards,
            last_updated: 0.0,
            processing: triggered.processing,
        };
        on_update(&latest);

        let mut polls = 0;
        while latest.processing && polls < max_polls {
            tokio::time::sleep(interval).await;
            latest = self.poll(&body.user_id).await?;
            polls += 1;
            on_update(&latest);
        }
        if latest.processing {
            tracing::warn!(polls, "stopped polling while the server was still processing");
        }
        Ok(latest)
    }
}

fn poll_interval_from_health(health: &Value) -> u64 {
    health
        .get("poll_interval_seconds")
        .and_then(Value::as_u64)
        .filter(|s| *s > 0)
        .unwrap_or(DEFAULT_POLL_INTERVAL_SECONDS)
}
