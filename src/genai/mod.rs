//! Client side of the hosted generative image model.
//!
//! The wire shape follows the provider's `:predict` contract: a list of
//! instances (prompt + inline base64 image) and a parameters block.

pub mod vertex;
#[cfg(test)]
pub(crate) mod fake;

use axum::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use vertex::VertexImageModel;

/// Field carrying base64 image bytes, both in requests and predictions.
pub const IMAGE_FIELD: &str = "bytesBase64Encoded";

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to build model client: {0}")]
    Client(String),

    #[error("model request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("model API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("failed to parse model response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait ImageModel: Send + Sync {
    async fn predict(&self, request: &PredictRequest) -> Result<PredictResponse, ModelError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictRequest {
    pub instances: Vec<Instance>,
    pub parameters: Parameters,
}

impl PredictRequest {
    /// One instance for `prompt` over the base64 `image`, asking for a single sample.
    pub fn single(image_b64: String, prompt: &str) -> Self {
        Self {
            instances: vec![Instance {
                prompt: prompt.to_string(),
                image: InlineImage {
                    bytes_base64_encoded: image_b64,
                },
            }],
            parameters: Parameters { sample_count: 1 },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub prompt: String,
    pub image: InlineImage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineImage {
    pub bytes_base64_encoded: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameters {
    pub sample_count: u32,
}

/// Predictions are kept as raw JSON; their fields are checked by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictResponse {
    #[serde(default)]
    pub predictions: Vec<serde_json::Value>,
}
