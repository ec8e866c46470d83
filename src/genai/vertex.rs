use axum::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use super::{ImageModel, ModelError, PredictRequest, PredictResponse};
use crate::config::AiConfig;

/// Calls a Vertex-AI-style `:predict` endpoint over HTTPS.
pub struct VertexImageModel {
    client: Client,
    url: String,
    access_token: Option<String>,
}

impl VertexImageModel {
    pub fn new(cfg: &AiConfig) -> Result<Self, ModelError> {
        let client = Client::builder()
            .timeout(cfg.timeout())
            .build()
            .map_err(|e| ModelError::Client(e.to_string()))?;
        Ok(Self {
            client,
            url: cfg.predict_url(),
            access_token: cfg.access_token.clone(),
        })
    }
}

#[async_trait]
impl ImageModel for VertexImageModel {
    async fn predict(&self, request: &PredictRequest) -> Result<PredictResponse, ModelError> {
        debug!(url = %self.url, instances = request.instances.len(), "sending predict request");

        let mut req = self.client.post(&self.url).json(request);
        if let Some(token) = &self.access_token {
            req = req.bearer_auth(token);
        }
        let response = req.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "predict request rejected by provider");
            return Err(ModelError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: PredictResponse = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;
        debug!(predictions = parsed.predictions.len(), "predict response received");
        Ok(parsed)
    }
}
