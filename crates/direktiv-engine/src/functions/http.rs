use std::time::Duration;

use async_trait::async_trait;

use direktiv_core::config::FunctionsConfig;
use direktiv_core::error::{DirektivError, Result};

use super::{FunctionInvoker, FunctionRequest};

/// Posts function requests to the sidecar's HTTP API.
#[derive(Clone)]
pub struct HttpFunctionInvoker {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFunctionInvoker {
    pub fn new(config: &FunctionsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| DirektivError::Config(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.invoker_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post(&self, url: String, body: Option<&FunctionRequest>) -> Result<()> {
        let request = self.client.post(&url);
        let request = match body {
            Some(body) => request.json(body),
            None => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| DirektivError::Cluster(format!("POST {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DirektivError::Cluster(format!(
                "POST {} returned {}: {}",
                url, status, text
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl FunctionInvoker for HttpFunctionInvoker {
    async fn invoke(&self, request: FunctionRequest) -> Result<()> {
        tracing::debug!(
            action = %request.action_id,
            instance = %request.instance_id,
            function = %request.function.id,
            "Invoking function"
        );
        self.post(self.url("/functions"), Some(&request)).await
    }

    async fn cancel(&self, action_id: &str) -> Result<()> {
        tracing::debug!(action = %action_id, "Cancelling function");
        self.post(self.url(&format!("/functions/{}/cancel", action_id)), None)
            .await
    }
}
