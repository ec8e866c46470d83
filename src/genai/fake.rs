use std::sync::Mutex;

use axum::async_trait;
use serde_json::json;

use super::{ImageModel, ModelError, PredictRequest, PredictResponse};

/// Test double that records every request and replays a canned response.
pub struct FakeModel {
    response: Mutex<Option<Result<PredictResponse, ModelError>>>,
    pub calls: Mutex<Vec<PredictRequest>>,
}

impl FakeModel {
    pub fn replying(response: PredictResponse) -> Self {
        Self {
            response: Mutex::new(Some(Ok(response))),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(err: ModelError) -> Self {
        Self {
            response: Mutex::new(Some(Err(err))),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A single prediction carrying `image_b64`.
    pub fn with_image(image_b64: &str, mime_type: &str) -> Self {
        Self::replying(PredictResponse {
            predictions: vec![json!({ "bytesBase64Encoded": image_b64, "mimeType": mime_type })],
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ImageModel for FakeModel {
    async fn predict(&self, request: &PredictRequest) -> Result<PredictResponse, ModelError> {
        self.calls.lock().unwrap().push(request.clone());
        self.response
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Err(ModelError::InvalidResponse("fake model already used".into())))
    }
}
