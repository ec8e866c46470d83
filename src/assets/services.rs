use std::path::Path;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{
    repo,
    repo_types::{AssetStatus, CreativeAsset},
};
use crate::{
    error::{is_unique_violation, AppError},
    genai::{ImageModel, ModelError, PredictRequest, IMAGE_FIELD},
    state::AppState,
    storage::StorageClient,
};

/// Failures of the modification pipeline, one per stage.
#[derive(Debug, Error)]
pub enum ModifyError {
    #[error("failed to read source image: {0:#}")]
    SourceUnreadable(anyhow::Error),

    #[error("prediction failed: {0}")]
    Predict(#[from] ModelError),

    #[error("model returned no predictions")]
    EmptyPredictions,

    #[error("prediction has no `bytesBase64Encoded` image")]
    MissingOutput,

    #[error("failed to decode generated image: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("failed to store generated image: {0:#}")]
    Write(anyhow::Error),
}

pub struct UploadItem<'a> {
    pub filename: Option<&'a str>,
    pub content_type: Option<&'a str>,
    pub body: Bytes,
}

/// Public URL under which a storage key is served.
pub fn public_url(key: &str) -> String {
    format!("/uploads/{key}")
}

/// Storage key for a new upload. Only the extension is taken from the client.
pub fn original_key(filename: Option<&str>, content_type: Option<&str>) -> String {
    let ext = filename
        .and_then(ext_from_filename)
        .or_else(|| content_type.and_then(ext_from_mime).map(str::to_string))
        .unwrap_or_else(|| "bin".to_string());
    format!("originals/{}.{}", Uuid::new_v4(), ext)
}

/// Storage key of the generated variant of `asset_id`.
pub fn modified_key(asset_id: i64, mime_type: Option<&str>) -> String {
    let ext = mime_type.and_then(ext_from_mime).unwrap_or("png");
    format!("modified_{asset_id}.{ext}")
}

fn ext_from_filename(name: &str) -> Option<String> {
    let ext = Path::new(name).extension()?.to_str()?;
    let ok = (1..=8).contains(&ext.len()) && ext.chars().all(|c| c.is_ascii_alphanumeric());
    ok.then(|| ext.to_ascii_lowercase())
}

fn ext_from_mime(ct: &str) -> Option<&'static str> {
    match ct {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "image/heic" => Some("heic"),
        _ => None,
    }
}

/// Writes the upload to storage and records it. The file is removed again if
/// the row cannot be inserted.
pub async fn store_upload(
    st: &AppState,
    item: UploadItem<'_>,
) -> Result<CreativeAsset, AppError> {
    let key = original_key(item.filename, item.content_type);
    let original_filename = item.filename.unwrap_or("").to_string();
    let size = item.body.len();

    st.storage
        .put_object(&key, item.body)
        .await
        .with_context(|| format!("store upload {key}"))?;

    match repo::insert_asset(&st.db, st.config.default_owner_id, &original_filename, &key).await {
        Ok(asset) => {
            info!(asset_id = asset.id, %key, size, "asset uploaded");
            Ok(asset)
        }
        Err(e) => {
            if let Err(cleanup) = st.storage.delete_object(&key).await {
                warn!(error = %cleanup, %key, "failed to remove orphaned upload");
            }
            if is_unique_violation(&e) {
                Err(AppError::Conflict(format!("asset path {key} already exists")))
            } else {
                error!(error = %e, "insert asset failed");
                Err(e.into())
            }
        }
    }
}

/// Reads `source_key`, asks the model for one variant guided by `prompt` and
/// stores the result. Returns the storage key of the variant.
pub async fn generate_variant(
    storage: &dyn StorageClient,
    model: &dyn ImageModel,
    asset_id: i64,
    source_key: &str,
    prompt: &str,
) -> Result<String, ModifyError> {
    let source = storage
        .get_object(source_key)
        .await
        .map_err(ModifyError::SourceUnreadable)?;

    let request = PredictRequest::single(STANDARD.encode(&source), prompt);
    let response = model.predict(&request).await?;

    if response.predictions.len() > 1 {
        warn!(asset_id, count = response.predictions.len(), "expected one prediction, using the first");
    }
    let prediction = response
        .predictions
        .first()
        .ok_or(ModifyError::EmptyPredictions)?;
    let encoded = prediction
        .get(IMAGE_FIELD)
        .and_then(Value::as_str)
        .ok_or(ModifyError::MissingOutput)?;
    let image = STANDARD.decode(encoded)?;

    let key = modified_key(asset_id, prediction.get("mimeType").and_then(Value::as_str));
    storage
        .put_object(&key, Bytes::from(image))
        .await
        .map_err(ModifyError::Write)?;
    Ok(key)
}

/// Runs the modification of one asset, driving its status through
/// `processing` to `completed` or `failed`.
pub async fn modify_asset(st: &AppState, asset_id: i64, prompt: &str) -> Result<String, AppError> {
    let asset = repo::find_by_id(&st.db, asset_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("asset {asset_id} not found")))?;

    if asset.status != AssetStatus::Uploaded {
        return Err(AppError::Conflict(format!(
            "asset {asset_id} is already {}",
            asset.status
        )));
    }
    repo::transition(
        &st.db,
        asset_id,
        AssetStatus::Uploaded,
        AssetStatus::Processing,
        None,
        Some(prompt),
    )
    .await?
    .ok_or_else(|| AppError::Conflict(format!("asset {asset_id} is already being processed")))?;

    let outcome = generate_variant(
        st.storage.as_ref(),
        st.model.as_ref(),
        asset_id,
        &asset.uploaded_path,
        prompt,
    )
    .await;

    let key = match outcome {
        Ok(key) => key,
        Err(e) => {
            error!(asset_id, error = %e, "asset modification failed");
            mark_failed(&st.db, asset_id).await;
            return Err(e.into());
        }
    };

    let completed = repo::transition(
        &st.db,
        asset_id,
        AssetStatus::Processing,
        AssetStatus::Completed,
        Some(&key),
        None,
    )
    .await;
    let err = match completed {
        Ok(Some(_)) => {
            info!(asset_id, %key, "asset modified");
            return Ok(key);
        }
        Ok(None) => AppError::Conflict(format!("asset {asset_id} left processing before it completed")),
        Err(e) => AppError::Internal(e),
    };

    error!(asset_id, error = %err, "failed to record completed asset");
    if let Err(cleanup) = st.storage.delete_object(&key).await {
        warn!(error = %cleanup, %key, "failed to remove unrecorded variant");
    }
    mark_failed(&st.db, asset_id).await;
    Err(err)
}

/// Best effort `processing -> failed`.
async fn mark_failed(db: &PgPool, asset_id: i64) {
    match repo::transition(db, asset_id, AssetStatus::Processing, AssetStatus::Failed, None, None).await {
        Ok(Some(_)) => {}
        Ok(None) => warn!(asset_id, "asset was no longer processing, status left as is"),
        Err(db_err) => error!(asset_id, error = %db_err, "failed to mark asset as failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AppConfig,
        genai::{fake::FakeModel, PredictResponse},
        storage::LocalStorage,
    };
    use axum::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    const SOURCE: &[u8] = b"\x89PNG source bytes";

    async fn storage_with_source() -> (tempfile::TempDir, LocalStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage
            .put_object("originals/src.png", Bytes::from_static(SOURCE))
            .await
            .unwrap();
        (dir, storage)
    }

    #[test]
    fn test_ext_from_mime() {
        assert_eq!(ext_from_mime("image/jpeg"), Some("jpg"));
        assert_eq!(ext_from_mime("image/jpg"), Some("jpg"));
        assert_eq!(ext_from_mime("image/png"), Some("png"));
        assert_eq!(ext_from_mime("image/webp"), Some("webp"));
        assert_eq!(ext_from_mime("application/octet-stream"), None);
    }

    #[test]
    fn original_key_ignores_client_path_components() {
        let key = original_key(Some("../../etc/cat.PNG"), None);
        assert!(key.starts_with("originals/"));
        assert!(key.ends_with(".png"));
        assert!(!key.contains(".."));

        let key = original_key(Some("no_extension"), Some("image/webp"));
        assert!(key.ends_with(".webp"));

        let key = original_key(Some("weird.ex/t"), None);
        assert!(key.ends_with(".bin"));

        let key = original_key(None, None);
        assert!(key.ends_with(".bin"));
    }

    #[test]
    fn original_keys_are_unique_per_upload() {
        assert_ne!(original_key(Some("a.png"), None), original_key(Some("a.png"), None));
    }

    #[test]
    fn modified_key_follows_naming_rule() {
        assert_eq!(modified_key(42, None), "modified_42.png");
        assert_eq!(modified_key(42, Some("image/jpeg")), "modified_42.jpg");
        assert_eq!(public_url("modified_42.png"), "/uploads/modified_42.png");
    }

    #[tokio::test]
    async fn payload_carries_base64_image_prompt_and_single_sample() {
        let (_dir, storage) = storage_with_source().await;
        let model = FakeModel::with_image(&STANDARD.encode(b"out"), "image/png");

        generate_variant(&storage, &model, 7, "originals/src.png", "  add a hat  ")
            .await
            .unwrap();

        let calls = model.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let sent = serde_json::to_value(&calls[0]).unwrap();
        assert_eq!(sent["instances"][0]["image"]["bytesBase64Encoded"], STANDARD.encode(SOURCE));
        assert_eq!(sent["instances"][0]["prompt"], "  add a hat  ");
        assert_eq!(sent["parameters"]["sampleCount"], 1);
    }

    #[tokio::test]
    async fn decoded_prediction_is_stored_under_modified_key() {
        let (dir, storage) = storage_with_source().await;
        let generated = b"generated image bytes".to_vec();
        let model = FakeModel::with_image(&STANDARD.encode(&generated), "image/png");

        let key = generate_variant(&storage, &model, 12, "originals/src.png", "p")
            .await
            .unwrap();

        assert_eq!(key, "modified_12.png");
        assert_eq!(std::fs::read(dir.path().join("modified_12.png")).unwrap(), generated);
    }

    #[tokio::test]
    async fn missing_source_fails_before_calling_the_model() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let model = FakeModel::with_image("AA==", "image/png");

        let err = generate_variant(&storage, &model, 1, "originals/missing.png", "p")
            .await
            .unwrap_err();

        assert!(matches!(err, ModifyError::SourceUnreadable(_)));
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn empty_predictions_write_nothing() {
        let (dir, storage) = storage_with_source().await;
        let model = FakeModel::replying(PredictResponse::default());

        let err = generate_variant(&storage, &model, 3, "originals/src.png", "p")
            .await
            .unwrap_err();

        assert!(matches!(err, ModifyError::EmptyPredictions));
        assert!(!dir.path().join("modified_3.png").exists());
    }

    #[tokio::test]
    async fn prediction_without_image_field_is_missing_output() {
        let (_dir, storage) = storage_with_source().await;
        for prediction in [json!({ "mimeType": "image/png" }), json!({ "bytesBase64Encoded": 17 })] {
            let model = FakeModel::replying(PredictResponse {
                predictions: vec![prediction],
            });
            let err = generate_variant(&storage, &model, 3, "originals/src.png", "p")
                .await
                .unwrap_err();
            assert!(matches!(err, ModifyError::MissingOutput));
        }
    }

    #[tokio::test]
    async fn undecodable_output_is_a_decode_error() {
        let (dir, storage) = storage_with_source().await;
        let model = FakeModel::with_image("not base64!!", "image/png");

        let err = generate_variant(&storage, &model, 4, "originals/src.png", "p")
            .await
            .unwrap_err();

        assert!(matches!(err, ModifyError::Decode(_)));
        assert!(!dir.path().join("modified_4.png").exists());
    }

    #[tokio::test]
    async fn model_failure_is_surfaced() {
        let (_dir, storage) = storage_with_source().await;
        let model = FakeModel::failing(ModelError::Api {
            status: 500,
            body: "boom".into(),
        });

        let err = generate_variant(&storage, &model, 5, "originals/src.png", "p")
            .await
            .unwrap_err();

        assert!(matches!(err, ModifyError::Predict(ModelError::Api { status: 500, .. })));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn write_failure_is_reported() {
        let (dir, storage) = storage_with_source().await;
        // a directory squatting on the target path makes the write fail
        std::fs::create_dir(dir.path().join("modified_6.png")).unwrap();
        let model = FakeModel::with_image(&STANDARD.encode(b"x"), "image/png");

        let err = generate_variant(&storage, &model, 6, "originals/src.png", "p")
            .await
            .unwrap_err();

        assert!(matches!(err, ModifyError::Write(_)));
    }

    async fn uploaded(dir: &Path, model: Arc<dyn ImageModel>) -> (AppState, CreativeAsset) {
        let st = AppState::live(dir, model).await;
        let asset = store_upload(
            &st,
            UploadItem {
                filename: Some("cat.png"),
                content_type: Some("image/png"),
                body: Bytes::from_static(SOURCE),
            },
        )
        .await
        .unwrap();
        (st, asset)
    }

    async fn reload(st: &AppState, id: i64) -> CreativeAsset {
        repo::find_by_id(&st.db, id).await.unwrap().unwrap()
    }

    /// Moves the asset out of `processing` behind the service's back, then
    /// answers like a healthy model.
    struct StatusStealingModel {
        db: PgPool,
        asset_id: i64,
        inner: FakeModel,
    }

    #[async_trait]
    impl ImageModel for StatusStealingModel {
        async fn predict(&self, request: &PredictRequest) -> Result<PredictResponse, ModelError> {
            sqlx::query("UPDATE creative_assets SET status = 'failed' WHERE id = $1")
                .bind(self.asset_id)
                .execute(&self.db)
                .await
                .map_err(|e| ModelError::Client(e.to_string()))?;
            self.inner.predict(request).await
        }
    }

    #[tokio::test]
    #[ignore = "requires a running Postgres at DATABASE_URL"]
    async fn upload_then_modify_completes_once() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(FakeModel::with_image(&STANDARD.encode(b"variant"), "image/png"));
        let (st, asset) = uploaded(dir.path(), model.clone()).await;

        assert_eq!(asset.status, AssetStatus::Uploaded);
        assert_eq!(asset.original_filename, "cat.png");
        assert_eq!(std::fs::read(dir.path().join(&asset.uploaded_path)).unwrap(), SOURCE);

        let key = modify_asset(&st, asset.id, "add a hat").await.unwrap();
        assert_eq!(key, format!("modified_{}.png", asset.id));
        assert_eq!(std::fs::read(dir.path().join(&key)).unwrap(), b"variant");

        let row = reload(&st, asset.id).await;
        assert_eq!(row.status, AssetStatus::Completed);
        assert_eq!(row.modified_path.as_deref(), Some(key.as_str()));
        assert_eq!(row.prompt.as_deref(), Some("add a hat"));

        let err = modify_asset(&st, asset.id, "again").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)), "{err}");
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    #[ignore = "requires a running Postgres at DATABASE_URL"]
    async fn pipeline_error_marks_asset_failed() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(FakeModel::replying(PredictResponse::default()));
        let (st, asset) = uploaded(dir.path(), model.clone()).await;

        let err = modify_asset(&st, asset.id, "p").await.unwrap_err();
        assert!(matches!(err, AppError::Modify(ModifyError::EmptyPredictions)), "{err}");

        let row = reload(&st, asset.id).await;
        assert_eq!(row.status, AssetStatus::Failed);
        assert!(row.modified_path.is_none());
        assert!(!dir.path().join(modified_key(asset.id, None)).exists());

        let err = modify_asset(&st, asset.id, "p").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)), "{err}");
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    #[ignore = "requires a running Postgres at DATABASE_URL"]
    async fn unknown_asset_is_not_found_before_the_model_is_called() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(FakeModel::with_image("AA==", "image/png"));
        let st = AppState::live(dir.path(), model.clone()).await;

        let err = modify_asset(&st, i64::MAX, "p").await.unwrap_err();

        assert!(matches!(err, AppError::NotFound(_)), "{err}");
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    #[ignore = "requires a running Postgres at DATABASE_URL"]
    async fn failed_insert_removes_the_stored_upload() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = AppState::live(dir.path(), Arc::new(FakeModel::with_image("AA==", "image/png"))).await;
        st.config = Arc::new(AppConfig {
            default_owner_id: -1,
            ..(*st.config).clone()
        });

        let err = store_upload(
            &st,
            UploadItem {
                filename: Some("cat.png"),
                content_type: None,
                body: Bytes::from_static(SOURCE),
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AppError::Database(_)), "{err}");
        let left = std::fs::read_dir(dir.path().join("originals"))
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(left, 0);
    }

    #[tokio::test]
    #[ignore = "requires a running Postgres at DATABASE_URL"]
    async fn rejected_completion_update_fails_the_asset_and_drops_the_variant() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(FakeModel::with_image(&STANDARD.encode(b"variant"), "image/png"));
        let (st, asset) = uploaded(dir.path(), model).await;

        let guard = format!("reject_completion_{}", asset.id);
        sqlx::query(&format!(
            "CREATE FUNCTION {guard}() RETURNS trigger LANGUAGE plpgsql AS $$ \
             BEGIN RAISE EXCEPTION 'completion rejected'; END $$"
        ))
        .execute(&st.db)
        .await
        .unwrap();
        sqlx::query(&format!(
            "CREATE TRIGGER {guard} BEFORE UPDATE ON creative_assets FOR EACH ROW \
             WHEN (NEW.id = {id} AND NEW.status = 'completed') EXECUTE FUNCTION {guard}()",
            id = asset.id
        ))
        .execute(&st.db)
        .await
        .unwrap();

        let result = modify_asset(&st, asset.id, "p").await;

        sqlx::query(&format!("DROP TRIGGER {guard} ON creative_assets"))
            .execute(&st.db)
            .await
            .unwrap();
        sqlx::query(&format!("DROP FUNCTION {guard}()"))
            .execute(&st.db)
            .await
            .unwrap();

        let err = result.unwrap_err();
        assert!(matches!(err, AppError::Internal(_)), "{err}");
        assert!(err.to_string().contains("completion rejected"), "{err}");
        assert_eq!(reload(&st, asset.id).await.status, AssetStatus::Failed);
        assert!(!dir.path().join(modified_key(asset.id, None)).exists());
    }

    #[tokio::test]
    #[ignore = "requires a running Postgres at DATABASE_URL"]
    async fn asset_leaving_processing_mid_run_drops_the_variant() {
        let dir = tempfile::tempdir().unwrap();
        let (st, asset) = uploaded(dir.path(), Arc::new(FakeModel::with_image("AA==", "image/png"))).await;
        let st = AppState::from_parts(
            st.db.clone(),
            st.config.clone(),
            st.storage.clone(),
            Arc::new(StatusStealingModel {
                db: st.db.clone(),
                asset_id: asset.id,
                inner: FakeModel::with_image(&STANDARD.encode(b"variant"), "image/png"),
            }),
        );

        let err = modify_asset(&st, asset.id, "p").await.unwrap_err();

        assert!(matches!(err, AppError::Conflict(_)), "{err}");
        let row = reload(&st, asset.id).await;
        assert_eq!(row.status, AssetStatus::Failed);
        assert!(row.modified_path.is_none());
        assert!(!dir.path().join(modified_key(asset.id, None)).exists());
    }
}
