use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument};

use crate::error::ProviderError;
use crate::types::{CallRequest, ExecutionRef};

/// Abstraction over the voice synthesis provider.
///
/// This trait intentionally hides:
/// - authentication
/// - wire format details
/// - error formats
///
/// Errors must be normalized into stable strings by the implementation.
#[async_trait]
pub trait VoiceProvider: Send + Sync + 'static {
    async fn start_call(&self, req: &CallRequest) -> Result<ExecutionRef, ProviderError>;
}

#[derive(Clone)]
pub struct HttpVoiceProvider {
    http: Client,
    base_url: String,
    api_key: String,
    request_timeout: Duration,
}

impl HttpVoiceProvider {
    pub fn new(
        base_url: String,
        api_key: String,
        request_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url,
            api_key,
            request_timeout,
        })
    }
}

#[async_trait]
impl VoiceProvider for HttpVoiceProvider {
    #[instrument(
        skip(self, req),
        fields(call_id = %req.metadata.call_id, agent_id = %req.agent_id),
        level = "debug"
    )]
    async fn start_call(&self, req: &CallRequest) -> Result<ExecutionRef, ProviderError> {
        let url = format!("{}/calls", self.base_url);

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .json(req)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let exec: ExecutionRef = resp
            .json()
            .await
            .map_err(|_| ProviderError::MissingExecutionId)?;

        debug!(execution_id = %exec.execution_id, "provider accepted call");

        Ok(exec)
    }
}
