use axum::{
    extract::{
        multipart::MultipartRejection, rejection::JsonRejection, DefaultBodyLimit, Multipart,
        Path, State,
    },
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::{info, instrument};

use super::{
    dto::{ModifyImageRequest, ModifyImageResponse, UploadResponse},
    repo,
    repo_types::CreativeAsset,
    services::{self, UploadItem},
};
use crate::{error::AppError, state::AppState};

/// Multipart field carrying the uploaded file.
const IMAGE_FIELD: &str = "image";

pub fn read_routes() -> Router<AppState> {
    Router::new().route("/assets/:id", get(get_asset))
}

pub fn write_routes(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/assets", get(list_assets).post(upload_asset))
        .route("/modify-image", post(modify_image))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}

pub async fn list_assets() -> &'static str {
    "Listing creative assets is not available yet."
}

#[instrument(skip(state))]
pub async fn get_asset(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<CreativeAsset>, AppError> {
    let asset = repo::find_by_id(&state.db, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("asset {id} not found")))?;
    Ok(Json(asset))
}

/// POST /assets (multipart, file in field `image`)
#[instrument(skip(state, mp))]
pub async fn upload_asset(
    State(state): State<AppState>,
    mp: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let mut mp = mp?;
    while let Some(field) = mp.next_field().await? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let body = field.bytes().await?;

        let asset = services::store_upload(
            &state,
            UploadItem {
                filename: filename.as_deref(),
                content_type: content_type.as_deref(),
                body,
            },
        )
        .await?;

        return Ok((
            StatusCode::CREATED,
            Json(UploadResponse {
                message: format!(
                    "File '{}' uploaded successfully",
                    filename.as_deref().unwrap_or("unnamed")
                ),
                status: "success",
                asset_id: asset.id,
                url: services::public_url(&asset.uploaded_path),
            }),
        ));
    }
    Err(AppError::BadRequest(format!(
        "multipart field '{IMAGE_FIELD}' is required"
    )))
}

/// POST /modify-image { asset_id, prompt }
#[instrument(skip(state, payload))]
pub async fn modify_image(
    State(state): State<AppState>,
    payload: Result<Json<ModifyImageRequest>, JsonRejection>,
) -> Result<Json<ModifyImageResponse>, AppError> {
    let Json(req) = payload?;
    if req.prompt.trim().is_empty() {
        return Err(AppError::BadRequest("prompt must not be empty".into()));
    }

    info!(asset_id = req.asset_id, "modifying asset");
    let key = services::modify_asset(&state, req.asset_id, &req.prompt).await?;

    Ok(Json(ModifyImageResponse {
        modified_image_url: services::public_url(&key),
        message: "Image modified successfully".into(),
        status: "success",
    }))
}
