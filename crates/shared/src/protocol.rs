use serde::{Deserialize, Serialize};

use crate::domain::{DressId, OperatorId, ProcessingStatus, SessionId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DressSummary {
    pub dress_id: DressId,
    pub name: String,
    pub image_urls: Vec<String>,
    pub price_cents: i64,
}

impl DressSummary {
    pub fn primary_image_url(&self) -> Option<&str> {
        self.image_urls.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TryOnRecord {
    pub operator_id: OperatorId,
    pub dress_id: DressId,
    pub input_image_url: String,
    pub result_image_url: String,
    pub status: ProcessingStatus,
    pub session_id: SessionId,
}
