mod supabase_store;

pub use supabase_store::SupabaseStore;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use replicate_integration::{
    ComposeError, ComposeOptions, ComposeRequest, ComposedImage, GarmentCompositor,
};
use reqwest::Client;
use shared::{
    domain::{DressId, Identity, OperatorId, ProcessingStatus, SessionId},
    error::{FailureKind, SessionFailure},
    protocol::{DressSummary, TryOnRecord},
};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

pub const MAX_IMAGE_BYTES: u64 = 10 * 1024 * 1024;

const CUSTOMER_IMAGE_KEY_PREFIX: &str = "customer-images";
const DOWNLOAD_FILE_PREFIX: &str = "virtual-tryon";

#[async_trait]
pub trait ImageSource: Send + Sync {
    fn file_name(&self) -> &str;
    fn content_type(&self) -> &str;
    fn size_bytes(&self) -> u64;
    async fn read_bytes(&self) -> Result<Vec<u8>>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores the blob and returns its public URL.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        allow_overwrite: bool,
    ) -> Result<String>;
    fn public_url_for(&self, key: &str) -> String;
}

pub struct MissingBlobStore;

#[async_trait]
impl BlobStore for MissingBlobStore {
    async fn put(
        &self,
        key: &str,
        _bytes: Vec<u8>,
        _content_type: &str,
        _allow_overwrite: bool,
    ) -> Result<String> {
        Err(anyhow!("blob store unavailable for key '{key}'"))
    }

    fn public_url_for(&self, key: &str) -> String {
        key.to_string()
    }
}

pub struct MissingGarmentCompositor;

#[async_trait]
impl GarmentCompositor for MissingGarmentCompositor {
    fn ensure_configured(&self) -> Result<(), ComposeError> {
        Err(ComposeError::NotConfigured)
    }

    async fn compose(&self, _request: ComposeRequest) -> Result<ComposedImage, ComposeError> {
        Err(ComposeError::NotConfigured)
    }

    async fn is_available(&self) -> bool {
        false
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn append(&self, record: TryOnRecord) -> Result<()>;
}

pub struct MissingRecordStore;

#[async_trait]
impl RecordStore for MissingRecordStore {
    async fn append(&self, record: TryOnRecord) -> Result<()> {
        Err(anyhow!(
            "record store unavailable for session {}",
            record.session_id.0
        ))
    }
}

pub trait AuthSession: Send + Sync {
    fn current(&self) -> Option<Identity>;
    fn subscribe(&self) -> watch::Receiver<Option<Identity>>;
}

pub struct StaticAuthSession {
    state: watch::Sender<Option<Identity>>,
}

impl StaticAuthSession {
    pub fn signed_in(identity: Identity) -> Self {
        let (state, _) = watch::channel(Some(identity));
        Self { state }
    }

    pub fn signed_out() -> Self {
        let (state, _) = watch::channel(None);
        Self { state }
    }

    pub fn set(&self, identity: Option<Identity>) {
        self.state.send_replace(identity);
    }
}

impl AuthSession for StaticAuthSession {
    fn current(&self) -> Option<Identity> {
        self.state.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.state.subscribe()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareContent {
    pub title: String,
    pub text: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareDisposition {
    Shared,
    Dismissed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareOutcome {
    SharedNatively,
    Dismissed,
    CopiedToClipboard,
}

#[async_trait]
pub trait SharePresenter: Send + Sync {
    fn supports_native_share(&self) -> bool;
    async fn share(&self, content: &ShareContent) -> Result<ShareDisposition>;
    async fn copy_to_clipboard(&self, text: &str) -> Result<()>;
}

pub struct MissingSharePresenter;

#[async_trait]
impl SharePresenter for MissingSharePresenter {
    fn supports_native_share(&self) -> bool {
        false
    }

    async fn share(&self, _content: &ShareContent) -> Result<ShareDisposition> {
        Err(anyhow!("native sharing is unavailable"))
    }

    async fn copy_to_clipboard(&self, _text: &str) -> Result<()> {
        Err(anyhow!("clipboard is unavailable"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Collecting,
    Uploading,
    Processing,
    ResultReady,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionPhase::Collecting => "collecting",
            SessionPhase::Uploading => "uploading",
            SessionPhase::Processing => "processing",
            SessionPhase::ResultReady => "result-ready",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum TryOnError {
    #[error("a new photo cannot be selected while the session is {phase}")]
    SelectionLocked { phase: SessionPhase },
    #[error("image is {size_bytes} bytes which exceeds the {limit_bytes} byte limit")]
    ImageTooLarge { size_bytes: u64, limit_bytes: u64 },
    #[error("unsupported file type '{content_type}'; only images can be tried on")]
    UnsupportedImageType { content_type: String },
    #[error("could not read the selected image: {0}")]
    ImageReadFailed(String),
    #[error("no photo is selected; choose an image before starting the try-on")]
    NoImageSelected,
    #[error("no operator is signed in")]
    NotSignedIn,
    #[error("the selected dress has no catalog image to compose against")]
    MissingGarmentImage,
    #[error("a try-on attempt cannot start while the session is {phase}")]
    NotCollecting { phase: SessionPhase },
    #[error("the virtual try-on service is not configured: add the model API token")]
    ServiceNotConfigured,
    #[error("failed to upload the customer photo: {0}")]
    UploadFailed(String),
    #[error("virtual try-on request failed: {0}")]
    CompositeFailed(String),
    #[error("the virtual try-on service produced no result image")]
    NoResultProduced,
    #[error("no result is ready while the session is {phase}")]
    NoResultReady { phase: SessionPhase },
    #[error("failed to download the result image: {0}")]
    DownloadFailed(String),
    #[error("failed to share the result image: {0}")]
    ShareFailed(String),
    #[error("the session cannot be reset while an attempt is {phase}")]
    ResetWhileBusy { phase: SessionPhase },
}

impl TryOnError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TryOnError::SelectionLocked { .. }
            | TryOnError::ImageTooLarge { .. }
            | TryOnError::UnsupportedImageType { .. }
            | TryOnError::ImageReadFailed(_)
            | TryOnError::NoImageSelected
            | TryOnError::NotSignedIn
            | TryOnError::MissingGarmentImage
            | TryOnError::NotCollecting { .. }
            | TryOnError::NoResultReady { .. }
            | TryOnError::ResetWhileBusy { .. } => FailureKind::Validation,
            TryOnError::ServiceNotConfigured => FailureKind::Configuration,
            TryOnError::UploadFailed(_) | TryOnError::CompositeFailed(_) => FailureKind::Transport,
            TryOnError::NoResultProduced => FailureKind::EmptyResult,
            TryOnError::DownloadFailed(_) | TryOnError::ShareFailed(_) => FailureKind::Action,
        }
    }

    pub fn to_failure(&self) -> SessionFailure {
        SessionFailure::new(self.kind(), self.to_string())
    }
}

fn map_compose_error(err: ComposeError) -> TryOnError {
    match err {
        ComposeError::NotConfigured => TryOnError::ServiceNotConfigured,
        ComposeError::EmptyOutput => TryOnError::NoResultProduced,
        ComposeError::Transport(message) | ComposeError::RunFailed(message) => {
            TryOnError::CompositeFailed(message)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPreview {
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub data_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionOutcome {
    Applied(LocalPreview),
    Superseded,
}

#[derive(Debug, Clone)]
pub struct TryOnRequest {
    pub session_id: SessionId,
    pub requester: Identity,
    pub dress_id: DressId,
    pub garment_image_url: String,
    pub image_bytes: Vec<u8>,
    pub image_content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTryOn {
    pub session_id: SessionId,
    pub input_image_url: String,
    pub result_image_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedImage {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    PhaseChanged(SessionPhase),
    Completed(CompletedTryOn),
    Failed(SessionFailure),
}

#[derive(Debug, Clone)]
struct SelectedImage {
    bytes: Vec<u8>,
    preview: LocalPreview,
}

struct SessionState {
    phase: SessionPhase,
    session_id: SessionId,
    selection_seq: u64,
    selected: Option<SelectedImage>,
    result: Option<CompletedTryOn>,
    last_failure: Option<SessionFailure>,
}

pub struct TryOnSession {
    http: Client,
    dress: DressSummary,
    compose_options: ComposeOptions,
    blob_store: Arc<dyn BlobStore>,
    compositor: Arc<dyn GarmentCompositor>,
    record_store: Arc<dyn RecordStore>,
    auth: Arc<dyn AuthSession>,
    share_presenter: Arc<dyn SharePresenter>,
    inner: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl TryOnSession {
    pub fn new(dress: DressSummary) -> Arc<Self> {
        Self::with_collaborators(
            dress,
            ComposeOptions::default(),
            Arc::new(MissingBlobStore),
            Arc::new(MissingGarmentCompositor),
            Arc::new(MissingRecordStore),
            Arc::new(StaticAuthSession::signed_out()),
            Arc::new(MissingSharePresenter),
        )
    }

    pub fn with_collaborators(
        dress: DressSummary,
        compose_options: ComposeOptions,
        blob_store: Arc<dyn BlobStore>,
        compositor: Arc<dyn GarmentCompositor>,
        record_store: Arc<dyn RecordStore>,
        auth: Arc<dyn AuthSession>,
        share_presenter: Arc<dyn SharePresenter>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            http: Client::new(),
            dress,
            compose_options,
            blob_store,
            compositor,
            record_store,
            auth,
            share_presenter,
            inner: Mutex::new(SessionState {
                phase: SessionPhase::Collecting,
                session_id: SessionId::generate(),
                selection_seq: 0,
                selected: None,
                result: None,
                last_failure: None,
            }),
            events,
        })
    }

    pub fn dress(&self) -> &DressSummary {
        &self.dress
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn phase(&self) -> SessionPhase {
        self.inner.lock().await.phase
    }

    pub async fn session_id(&self) -> SessionId {
        self.inner.lock().await.session_id
    }

    pub async fn selected_preview(&self) -> Option<LocalPreview> {
        self.inner.lock().await.selected.as_ref().map(|selected| selected.preview.clone())
    }

    pub async fn result(&self) -> Option<CompletedTryOn> {
        self.inner.lock().await.result.clone()
    }

    pub async fn last_failure(&self) -> Option<SessionFailure> {
        self.inner.lock().await.last_failure.clone()
    }

    pub async fn select_image(
        &self,
        source: &dyn ImageSource,
    ) -> Result<SelectionOutcome, TryOnError> {
        let declared_size = source.size_bytes();
        if declared_size > MAX_IMAGE_BYTES {
            return Err(TryOnError::ImageTooLarge {
                size_bytes: declared_size,
                limit_bytes: MAX_IMAGE_BYTES,
            });
        }
        let content_type = source.content_type().to_string();
        if !is_image_content_type(&content_type) {
            return Err(TryOnError::UnsupportedImageType { content_type });
        }

        let seq = {
            let mut inner = self.inner.lock().await;
            if inner.phase != SessionPhase::Collecting {
                return Err(TryOnError::SelectionLocked { phase: inner.phase });
            }
            inner.selection_seq += 1;
            inner.selection_seq
        };

        let file_name = source.file_name().to_string();
        let bytes = source
            .read_bytes()
            .await
            .map_err(|err| TryOnError::ImageReadFailed(err.to_string()))?;
        let actual_size = bytes.len() as u64;
        if actual_size > MAX_IMAGE_BYTES {
            return Err(TryOnError::ImageTooLarge {
                size_bytes: actual_size,
                limit_bytes: MAX_IMAGE_BYTES,
            });
        }

        let mut inner = self.inner.lock().await;
        if inner.selection_seq != seq {
            // A newer selection finished reading first; this one is stale.
            debug!(seq, newest = inner.selection_seq, "discarding stale photo selection");
            return Ok(SelectionOutcome::Superseded);
        }
        if inner.phase != SessionPhase::Collecting {
            return Err(TryOnError::SelectionLocked { phase: inner.phase });
        }

        let preview = LocalPreview {
            file_name: file_name.clone(),
            content_type: content_type.clone(),
            size_bytes: actual_size,
            data_url: data_url_for(&content_type, &bytes),
        };
        inner.selected = Some(SelectedImage {
            bytes,
            preview: preview.clone(),
        });
        inner.last_failure = None;
        info!(file_name = %preview.file_name, size_bytes = actual_size, "customer photo selected");
        Ok(SelectionOutcome::Applied(preview))
    }

    pub async fn clear_selection(&self) -> Result<(), TryOnError> {
        let mut inner = self.inner.lock().await;
        if inner.phase != SessionPhase::Collecting {
            return Err(TryOnError::SelectionLocked { phase: inner.phase });
        }
        inner.selected = None;
        Ok(())
    }

    pub async fn start_try_on(&self) -> Result<CompletedTryOn, TryOnError> {
        let requester = self.auth.current().ok_or(TryOnError::NotSignedIn)?;
        let garment_image_url = self
            .dress
            .primary_image_url()
            .ok_or(TryOnError::MissingGarmentImage)?
            .to_string();

        let request = {
            let mut inner = self.inner.lock().await;
            if inner.phase != SessionPhase::Collecting {
                return Err(TryOnError::NotCollecting { phase: inner.phase });
            }
            let Some(selected) = inner.selected.as_ref() else {
                return Err(TryOnError::NoImageSelected);
            };

            // Credentials are checked before any upload so a misconfigured
            // compositor cannot strand a freshly persisted photo.
            self.compositor
                .ensure_configured()
                .map_err(map_compose_error)?;

            let request = TryOnRequest {
                session_id: inner.session_id,
                requester,
                dress_id: self.dress.dress_id.clone(),
                garment_image_url,
                image_bytes: selected.bytes.clone(),
                image_content_type: selected.preview.content_type.clone(),
            };
            inner.last_failure = None;
            inner.phase = SessionPhase::Uploading;
            request
        };
        self.emit_phase(SessionPhase::Uploading);
        info!(
            session_id = %request.session_id.0,
            operator_id = %request.requester.id.0,
            dress_id = %request.dress_id.0,
            "try-on attempt started"
        );

        match self.run_attempt(&request).await {
            Ok(completed) => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.phase = SessionPhase::ResultReady;
                    inner.result = Some(completed.clone());
                }
                self.emit_phase(SessionPhase::ResultReady);
                let _ = self.events.send(SessionEvent::Completed(completed.clone()));
                info!(session_id = %completed.session_id.0, "try-on attempt completed");
                Ok(completed)
            }
            Err(err) => {
                let failure = err.to_failure();
                {
                    let mut inner = self.inner.lock().await;
                    inner.phase = SessionPhase::Collecting;
                    inner.last_failure = Some(failure.clone());
                }
                warn!(
                    session_id = %request.session_id.0,
                    kind = ?failure.kind,
                    "try-on attempt failed: {}",
                    failure.message
                );
                self.emit_phase(SessionPhase::Collecting);
                let _ = self.events.send(SessionEvent::Failed(failure));
                Err(err)
            }
        }
    }

    async fn run_attempt(&self, request: &TryOnRequest) -> Result<CompletedTryOn, TryOnError> {
        let key = storage_key_for(
            &request.requester.id,
            &request.image_content_type,
            Utc::now().timestamp_millis(),
        );
        let input_image_url = self
            .blob_store
            .put(
                &key,
                request.image_bytes.clone(),
                &request.image_content_type,
                false,
            )
            .await
            .map_err(|err| TryOnError::UploadFailed(err.to_string()))?;
        info!(session_id = %request.session_id.0, key = %key, "customer photo persisted");

        {
            let mut inner = self.inner.lock().await;
            inner.phase = SessionPhase::Processing;
        }
        self.emit_phase(SessionPhase::Processing);

        let composed = self
            .compositor
            .compose(ComposeRequest {
                human_image_url: input_image_url.clone(),
                garment_image_url: request.garment_image_url.clone(),
                options: self.compose_options.clone(),
            })
            .await
            .map_err(map_compose_error)?;

        let record = TryOnRecord {
            operator_id: request.requester.id.clone(),
            dress_id: request.dress_id.clone(),
            input_image_url: input_image_url.clone(),
            result_image_url: composed.result_image_url.clone(),
            status: ProcessingStatus::Completed,
            session_id: request.session_id,
        };
        if let Err(err) = self.record_store.append(record).await {
            // History is best effort; the result still stands.
            warn!(session_id = %request.session_id.0, "failed to append try-on record: {err:#}");
        }

        Ok(CompletedTryOn {
            session_id: request.session_id,
            input_image_url,
            result_image_url: composed.result_image_url,
        })
    }

    pub async fn download(&self) -> Result<DownloadedImage, TryOnError> {
        let completed = self.ready_result().await?;
        let response = self
            .http
            .get(&completed.result_image_url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| TryOnError::DownloadFailed(err.to_string()))?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| TryOnError::DownloadFailed(err.to_string()))?
            .to_vec();

        let file_name = download_file_name(
            &self.dress.name,
            file_extension_for(&content_type),
            Utc::now().timestamp_millis(),
        );
        info!(file_name = %file_name, size_bytes = bytes.len(), "result image downloaded");
        Ok(DownloadedImage {
            file_name,
            content_type,
            bytes,
        })
    }

    pub async fn share(&self) -> Result<ShareOutcome, TryOnError> {
        let completed = self.ready_result().await?;
        let content = ShareContent {
            title: format!("Virtual Try-On: {}", self.dress.name),
            text: format!("Check out how I look in this {}!", self.dress.name),
            url: completed.result_image_url,
        };

        if self.share_presenter.supports_native_share() {
            return match self.share_presenter.share(&content).await {
                Ok(ShareDisposition::Shared) => Ok(ShareOutcome::SharedNatively),
                Ok(ShareDisposition::Dismissed) => {
                    debug!("native share dismissed by the operator");
                    Ok(ShareOutcome::Dismissed)
                }
                Err(err) => Err(TryOnError::ShareFailed(err.to_string())),
            };
        }

        self.share_presenter
            .copy_to_clipboard(&content.url)
            .await
            .map_err(|err| TryOnError::ShareFailed(err.to_string()))?;
        Ok(ShareOutcome::CopiedToClipboard)
    }

    pub async fn reset(&self) -> Result<(), TryOnError> {
        let new_session_id = {
            let mut inner = self.inner.lock().await;
            if matches!(inner.phase, SessionPhase::Uploading | SessionPhase::Processing) {
                return Err(TryOnError::ResetWhileBusy { phase: inner.phase });
            }
            inner.phase = SessionPhase::Collecting;
            inner.selected = None;
            inner.result = None;
            inner.last_failure = None;
            inner.session_id = SessionId::generate();
            inner.session_id
        };
        info!(session_id = %new_session_id.0, "session reset for a new attempt");
        self.emit_phase(SessionPhase::Collecting);
        Ok(())
    }

    async fn ready_result(&self) -> Result<CompletedTryOn, TryOnError> {
        let inner = self.inner.lock().await;
        if inner.phase != SessionPhase::ResultReady {
            return Err(TryOnError::NoResultReady { phase: inner.phase });
        }
        inner
            .result
            .clone()
            .ok_or(TryOnError::NoResultReady { phase: inner.phase })
    }

    fn emit_phase(&self, phase: SessionPhase) {
        let _ = self.events.send(SessionEvent::PhaseChanged(phase));
    }
}

fn is_image_content_type(content_type: &str) -> bool {
    content_type
        .to_ascii_lowercase()
        .starts_with("image/")
}

fn data_url_for(content_type: &str, bytes: &[u8]) -> String {
    format!("data:{content_type};base64,{}", STANDARD.encode(bytes))
}

fn storage_key_for(operator_id: &OperatorId, content_type: &str, unix_millis: i64) -> String {
    format!(
        "{CUSTOMER_IMAGE_KEY_PREFIX}/{}/{unix_millis}.{}",
        operator_id.0,
        file_extension_for(content_type)
    )
}

fn file_extension_for(content_type: &str) -> &'static str {
    match content_type.to_ascii_lowercase().as_str() {
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "jpg",
    }
}

fn dress_slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut previous_dash = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            previous_dash = false;
        } else if !previous_dash && !slug.is_empty() {
            slug.push('-');
            previous_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("dress");
    }
    slug
}

fn download_file_name(dress_name: &str, extension: &str, unix_millis: i64) -> String {
    format!(
        "{DOWNLOAD_FILE_PREFIX}-{}-{unix_millis}.{extension}",
        dress_slug(dress_name)
    )
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
