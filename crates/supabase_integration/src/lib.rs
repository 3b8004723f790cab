use anyhow::{anyhow, Context, Result};
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use serde::Serialize;
use url::Url;

pub const DEFAULT_STORAGE_BUCKET: &str = "try-on-images";
pub const DEFAULT_RECORDS_TABLE: &str = "try_ons";

#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub project_url: String,
    pub api_key: String,
    pub storage_bucket: String,
    pub records_table: String,
}

impl SupabaseConfig {
    pub fn new(project_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            project_url: project_url.into(),
            api_key: api_key.into(),
            storage_bucket: DEFAULT_STORAGE_BUCKET.to_string(),
            records_table: DEFAULT_RECORDS_TABLE.to_string(),
        }
    }
}

/// Thin REST client for the two Supabase surfaces the try-on flow touches:
/// object storage uploads and table inserts.
#[derive(Clone)]
pub struct SupabaseClient {
    http: Client,
    config: SupabaseConfig,
}

impl SupabaseClient {
    pub fn new(config: SupabaseConfig) -> Result<Self> {
        Url::parse(&config.project_url)
            .with_context(|| format!("invalid Supabase project url '{}'", config.project_url))?;
        if config.api_key.trim().is_empty() {
            return Err(anyhow!("Supabase API key must not be empty"));
        }
        Ok(Self {
            http: Client::new(),
            config,
        })
    }

    pub fn records_table(&self) -> &str {
        &self.config.records_table
    }

    fn base_url(&self) -> &str {
        self.config.project_url.trim_end_matches('/')
    }

    pub async fn upload_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> Result<()> {
        let response = self
            .http
            .post(format!(
                "{}/storage/v1/object/{}/{key}",
                self.base_url(),
                self.config.storage_bucket
            ))
            .bearer_auth(&self.config.api_key)
            .header("apikey", &self.config.api_key)
            .header("x-upsert", if upsert { "true" } else { "false" })
            .header(CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("storage upload for '{key}' failed"))?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            return Err(anyhow!(
                "storage object '{key}' already exists and overwrite is disabled"
            ));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "storage upload for '{key}' rejected with {status}: {detail}"
            ));
        }
        Ok(())
    }

    pub fn public_object_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{key}",
            self.base_url(),
            self.config.storage_bucket
        )
    }

    pub async fn insert_row<T: Serialize + Sync>(&self, table: &str, row: &T) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/rest/v1/{table}", self.base_url()))
            .bearer_auth(&self.config.api_key)
            .header("apikey", &self.config.api_key)
            .header("Prefer", "return=minimal")
            .json(row)
            .send()
            .await
            .with_context(|| format!("insert into '{table}' failed"))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "insert into '{table}' rejected with {status}: {detail}"
            ));
        }
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        self.http
            .get(format!("{}/rest/v1/", self.base_url()))
            .bearer_auth(&self.config.api_key)
            .header("apikey", &self.config.api_key)
            .send()
            .await
            .context("Supabase ping failed")?
            .error_for_status()
            .context("Supabase ping rejected")?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
