use anyhow::Context;
use sqlx::PgPool;

use super::repo_types::{AssetStatus, CreativeAsset};

const COLUMNS: &str = "id, user_id, original_filename, uploaded_path, modified_path, prompt, \
                       status, created_at, updated_at";

/// Insert a freshly uploaded asset.
pub async fn insert_asset(
    db: &PgPool,
    user_id: i64,
    original_filename: &str,
    uploaded_path: &str,
) -> sqlx::Result<CreativeAsset> {
    sqlx::query_as::<_, CreativeAsset>(&format!(
        r#"
        INSERT INTO creative_assets (user_id, original_filename, uploaded_path, status)
        VALUES ($1, $2, $3, $4)
        RETURNING {COLUMNS}
        "#
    ))
    .bind(user_id)
    .bind(original_filename)
    .bind(uploaded_path)
    .bind(AssetStatus::Uploaded.as_str())
    .fetch_one(db)
    .await
}

pub async fn find_by_id(db: &PgPool, asset_id: i64) -> sqlx::Result<Option<CreativeAsset>> {
    sqlx::query_as::<_, CreativeAsset>(&format!(
        "SELECT {COLUMNS} FROM creative_assets WHERE id = $1"
    ))
    .bind(asset_id)
    .fetch_optional(db)
    .await
}

/// Move an asset from `from` to `to`, optionally recording the modified path
/// and prompt. Returns `None` when the row is not currently in `from`.
pub async fn transition(
    db: &PgPool,
    asset_id: i64,
    from: AssetStatus,
    to: AssetStatus,
    modified_path: Option<&str>,
    prompt: Option<&str>,
) -> anyhow::Result<Option<CreativeAsset>> {
    anyhow::ensure!(
        from.can_transition_to(to),
        "illegal asset status transition {from} -> {to}"
    );
    let row = sqlx::query_as::<_, CreativeAsset>(&format!(
        r#"
        UPDATE creative_assets
           SET status = $3,
               modified_path = COALESCE($4, modified_path),
               prompt = COALESCE($5, prompt),
               updated_at = now()
         WHERE id = $1 AND status = $2
        RETURNING {COLUMNS}
        "#
    ))
    .bind(asset_id)
    .bind(from.as_str())
    .bind(to.as_str())
    .bind(modified_path)
    .bind(prompt)
    .fetch_optional(db)
    .await
    .with_context(|| format!("update asset {asset_id} status {from} -> {to}"))?;
    Ok(row)
}
