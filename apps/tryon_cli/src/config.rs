use std::{collections::HashMap, fs};

use supabase_integration::{DEFAULT_RECORDS_TABLE, DEFAULT_STORAGE_BUCKET};

#[derive(Debug, Clone)]
pub struct Settings {
    pub supabase_url: String,
    pub supabase_service_key: String,
    pub storage_bucket: String,
    pub records_table: String,
    pub replicate_api_token: Option<String>,
    pub replicate_model_version: Option<String>,
    pub poll_interval_ms: u64,
    pub operator_id: String,
    pub operator_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            supabase_url: "http://127.0.0.1:54321".into(),
            supabase_service_key: "dev-service-key".into(),
            storage_bucket: DEFAULT_STORAGE_BUCKET.into(),
            records_table: DEFAULT_RECORDS_TABLE.into(),
            replicate_api_token: None,
            replicate_model_version: None,
            poll_interval_ms: 1000,
            operator_id: "op-local".into(),
            operator_name: "Showroom Operator".into(),
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("tryon.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            apply_file_values(&mut settings, &file_cfg);
        }
    }

    if let Ok(v) = std::env::var("SUPABASE_URL") {
        settings.supabase_url = v;
    }
    if let Ok(v) = std::env::var("APP__SUPABASE_URL") {
        settings.supabase_url = v;
    }

    if let Ok(v) = std::env::var("SUPABASE_SERVICE_KEY") {
        settings.supabase_service_key = v;
    }
    if let Ok(v) = std::env::var("APP__SUPABASE_SERVICE_KEY") {
        settings.supabase_service_key = v;
    }

    if let Ok(v) = std::env::var("APP__STORAGE_BUCKET") {
        settings.storage_bucket = v;
    }
    if let Ok(v) = std::env::var("APP__RECORDS_TABLE") {
        settings.records_table = v;
    }

    if let Ok(v) = std::env::var("REPLICATE_API_TOKEN") {
        settings.replicate_api_token = Some(v);
    }
    if let Ok(v) = std::env::var("APP__REPLICATE_API_TOKEN") {
        settings.replicate_api_token = Some(v);
    }

    if let Ok(v) = std::env::var("REPLICATE_MODEL_VERSION") {
        settings.replicate_model_version = Some(v);
    }
    if let Ok(v) = std::env::var("APP__REPLICATE_MODEL_VERSION") {
        settings.replicate_model_version = Some(v);
    }

    if let Ok(v) = std::env::var("APP__POLL_INTERVAL_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.poll_interval_ms = parsed;
        }
    }

    if let Ok(v) = std::env::var("APP__OPERATOR_ID") {
        settings.operator_id = v;
    }
    if let Ok(v) = std::env::var("APP__OPERATOR_NAME") {
        settings.operator_name = v;
    }

    settings
}

fn apply_file_values(settings: &mut Settings, file_cfg: &HashMap<String, String>) {
    if let Some(v) = file_cfg.get("supabase_url") {
        settings.supabase_url = v.clone();
    }
    if let Some(v) = file_cfg.get("supabase_service_key") {
        settings.supabase_service_key = v.clone();
    }
    if let Some(v) = file_cfg.get("storage_bucket") {
        settings.storage_bucket = v.clone();
    }
    if let Some(v) = file_cfg.get("records_table") {
        settings.records_table = v.clone();
    }
    if let Some(v) = file_cfg.get("replicate_api_token") {
        settings.replicate_api_token = Some(v.clone());
    }
    if let Some(v) = file_cfg.get("replicate_model_version") {
        settings.replicate_model_version = Some(v.clone());
    }
    if let Some(v) = file_cfg.get("operator_id") {
        settings.operator_id = v.clone();
    }
    if let Some(v) = file_cfg.get("operator_name") {
        settings.operator_name = v.clone();
    }
}
