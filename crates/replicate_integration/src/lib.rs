use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const IDM_VTON_MODEL_VERSION: &str =
    "cuuupid/idm-vton:c871bb9b046607b680449ecbae55fd8c6d945e0a1948644bf2361b3d021d3ff4";

const REPLICATE_API_BASE_URL: &str = "https://api.replicate.com";

#[derive(Debug, Clone)]
pub struct ReplicateConfig {
    pub api_token: Option<String>,
    pub api_base_url: String,
    pub model_version: String,
    pub poll_interval: Duration,
}

impl Default for ReplicateConfig {
    fn default() -> Self {
        Self {
            api_token: None,
            api_base_url: REPLICATE_API_BASE_URL.to_string(),
            model_version: IDM_VTON_MODEL_VERSION.to_string(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl ReplicateConfig {
    pub fn with_api_token(api_token: Option<String>) -> Self {
        Self {
            api_token,
            ..Self::default()
        }
    }

    fn version_id(&self) -> &str {
        self.model_version
            .rsplit(':')
            .next()
            .unwrap_or(&self.model_version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeOptions {
    pub garment_description: String,
    pub denoise_steps: u32,
    pub seed: u32,
}

impl Default for ComposeOptions {
    fn default() -> Self {
        Self {
            garment_description: "dress".to_string(),
            denoise_steps: 30,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeRequest {
    pub human_image_url: String,
    pub garment_image_url: String,
    pub options: ComposeOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedImage {
    pub result_image_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComposeError {
    #[error("garment compositor is not configured: missing API token")]
    NotConfigured,
    #[error("garment composite request failed: {0}")]
    Transport(String),
    #[error("garment composite run did not complete: {0}")]
    RunFailed(String),
    #[error("garment compositor produced no result image")]
    EmptyOutput,
}

/// Turns a customer photo plus a garment photo into a composite image of the
/// customer wearing the garment.
#[async_trait]
pub trait GarmentCompositor: Send + Sync {
    /// Local credential check. Never performs network I/O.
    fn ensure_configured(&self) -> Result<(), ComposeError>;
    async fn compose(&self, request: ComposeRequest) -> Result<ComposedImage, ComposeError>;
    /// Availability probe for status displays only; callers must not gate
    /// the try-on workflow on it.
    async fn is_available(&self) -> bool;
}

#[derive(Debug, Serialize)]
struct CreatePredictionRequest<'a> {
    version: &'a str,
    input: PredictionInput<'a>,
}

#[derive(Debug, Serialize)]
struct PredictionInput<'a> {
    human_img: &'a str,
    garm_img: &'a str,
    garment_des: &'a str,
    is_checked: bool,
    is_checked_crop: bool,
    denoise_steps: u32,
    seed: u32,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    id: String,
    status: PredictionStatus,
    #[serde(default)]
    output: Option<PredictionOutput>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

/// The model returns either a single image URL or a sequence of them
/// depending on the version; both shapes normalize to the first URL.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PredictionOutput {
    Single(String),
    Many(Vec<String>),
}

impl PredictionOutput {
    pub fn into_first_url(self) -> Option<String> {
        match self {
            PredictionOutput::Single(url) => (!url.is_empty()).then_some(url),
            PredictionOutput::Many(urls) => urls.into_iter().find(|url| !url.is_empty()),
        }
    }
}

pub struct ReplicateCompositor {
    http: Client,
    config: ReplicateConfig,
}

impl ReplicateCompositor {
    pub fn new(config: ReplicateConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    fn base_url(&self) -> &str {
        self.config.api_base_url.trim_end_matches('/')
    }

    fn api_token(&self) -> Result<&str, ComposeError> {
        match self.config.api_token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(ComposeError::NotConfigured),
        }
    }

    async fn create_prediction(
        &self,
        token: &str,
        request: &ComposeRequest,
    ) -> Result<Prediction, ComposeError> {
        self.http
            .post(format!("{}/v1/predictions", self.base_url()))
            .bearer_auth(token)
            .json(&CreatePredictionRequest {
                version: self.config.version_id(),
                input: PredictionInput {
                    human_img: &request.human_image_url,
                    garm_img: &request.garment_image_url,
                    garment_des: &request.options.garment_description,
                    is_checked: true,
                    is_checked_crop: false,
                    denoise_steps: request.options.denoise_steps,
                    seed: request.options.seed,
                },
            })
            .send()
            .await
            .map_err(transport)?
            .error_for_status()
            .map_err(transport)?
            .json()
            .await
            .map_err(transport)
    }

    async fn fetch_prediction(&self, token: &str, id: &str) -> Result<Prediction, ComposeError> {
        self.http
            .get(format!("{}/v1/predictions/{id}", self.base_url()))
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport)?
            .error_for_status()
            .map_err(transport)?
            .json()
            .await
            .map_err(transport)
    }
}

fn transport(err: reqwest::Error) -> ComposeError {
    ComposeError::Transport(err.to_string())
}

#[async_trait]
impl GarmentCompositor for ReplicateCompositor {
    fn ensure_configured(&self) -> Result<(), ComposeError> {
        self.api_token().map(|_| ())
    }

    async fn compose(&self, request: ComposeRequest) -> Result<ComposedImage, ComposeError> {
        let token = self.api_token()?;
        info!(
            model = %self.config.model_version,
            garment_image = %request.garment_image_url,
            "submitting garment composite request"
        );

        let mut prediction = self.create_prediction(token, &request).await?;
        debug!(
            prediction_id = %prediction.id,
            status = ?prediction.status,
            "prediction created"
        );

        loop {
            match prediction.status {
                PredictionStatus::Succeeded => {
                    let result_image_url = prediction
                        .output
                        .and_then(PredictionOutput::into_first_url)
                        .ok_or(ComposeError::EmptyOutput)?;
                    info!(prediction_id = %prediction.id, "garment composite run succeeded");
                    return Ok(ComposedImage { result_image_url });
                }
                PredictionStatus::Failed | PredictionStatus::Canceled => {
                    let status = prediction.status;
                    let reason = prediction
                        .error
                        .unwrap_or_else(|| format!("prediction ended with status {status:?}"));
                    return Err(ComposeError::RunFailed(reason));
                }
                PredictionStatus::Starting | PredictionStatus::Processing => {
                    tokio::time::sleep(self.config.poll_interval).await;
                    prediction = self.fetch_prediction(token, &prediction.id).await?;
                }
            }
        }
    }

    async fn is_available(&self) -> bool {
        let Ok(token) = self.api_token() else {
            return false;
        };
        match self
            .http
            .get(format!("{}/v1/models", self.base_url()))
            .bearer_auth(token)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!("garment compositor availability probe failed: {err}");
                false
            }
        }
    }
}

/// Composes every request concurrently, preserving input order. A failed
/// request does not abort the others.
pub async fn compose_all(
    compositor: &dyn GarmentCompositor,
    requests: Vec<ComposeRequest>,
) -> Vec<Result<ComposedImage, ComposeError>> {
    join_all(
        requests
            .into_iter()
            .map(|request| compositor.compose(request)),
    )
    .await
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
