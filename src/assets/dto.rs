use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message: String,
    pub status: &'static str,
    pub asset_id: i64,
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct ModifyImageRequest {
    pub asset_id: i64,
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct ModifyImageResponse {
    pub modified_image_url: String,
    pub message: String,
    pub status: &'static str,
}
