use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::protocol::TryOnRecord;
use supabase_integration::{SupabaseClient, SupabaseConfig};

use crate::{BlobStore, RecordStore};

pub struct SupabaseStore {
    client: SupabaseClient,
}

impl SupabaseStore {
    pub fn new(config: SupabaseConfig) -> Result<Arc<Self>> {
        let client =
            SupabaseClient::new(config).context("failed to initialize Supabase client")?;
        Ok(Arc::new(Self { client }))
    }

    pub fn client(&self) -> &SupabaseClient {
        &self.client
    }
}

#[async_trait]
impl BlobStore for SupabaseStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        allow_overwrite: bool,
    ) -> Result<String> {
        self.client
            .upload_object(key, bytes, content_type, allow_overwrite)
            .await
            .with_context(|| format!("failed to persist customer photo '{key}'"))?;
        Ok(self.client.public_object_url(key))
    }

    fn public_url_for(&self, key: &str) -> String {
        self.client.public_object_url(key)
    }
}

#[async_trait]
impl RecordStore for SupabaseStore {
    async fn append(&self, record: TryOnRecord) -> Result<()> {
        let session_id = record.session_id;
        self.client
            .insert_row(self.client.records_table(), &record)
            .await
            .with_context(|| format!("failed to append try-on record for session {}", session_id.0))
    }
}
