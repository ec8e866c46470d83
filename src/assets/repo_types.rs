use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;

/// Lifecycle of an asset: `uploaded → processing → completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl AssetStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AssetStatus::Uploaded => "uploaded",
            AssetStatus::Processing => "processing",
            AssetStatus::Completed => "completed",
            AssetStatus::Failed => "failed",
        }
    }

    /// Only forward moves are legal.
    pub fn can_transition_to(self, next: AssetStatus) -> bool {
        matches!(
            (self, next),
            (AssetStatus::Uploaded, AssetStatus::Processing)
                | (AssetStatus::Processing, AssetStatus::Completed)
                | (AssetStatus::Processing, AssetStatus::Failed)
        )
    }
}

impl fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for AssetStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "uploaded" => Ok(AssetStatus::Uploaded),
            "processing" => Ok(AssetStatus::Processing),
            "completed" => Ok(AssetStatus::Completed),
            "failed" => Ok(AssetStatus::Failed),
            other => Err(format!("unknown asset status {other:?}")),
        }
    }
}

/// Row of `creative_assets`. Paths are storage keys relative to the asset root.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct CreativeAsset {
    pub id: i64,
    pub user_id: i64,
    pub original_filename: String,
    pub uploaded_path: String,
    pub modified_path: Option<String>,
    pub prompt: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: AssetStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}
