use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use replicate_integration::{ComposeOptions, ReplicateCompositor, ReplicateConfig};
use serde_json::{json, Value};
use shared::domain::{DressId, Identity, OperatorId};
use shared::protocol::DressSummary;
use supabase_integration::SupabaseConfig;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tryon_core::{
    ImageSource, MissingSharePresenter, SelectionOutcome, SessionPhase, StaticAuthSession,
    SupabaseStore, TryOnSession,
};

const RESULT_PNG: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x77];

#[derive(Clone)]
struct BackendState {
    base_url: String,
    uploads: Arc<Mutex<HashMap<String, (String, Vec<u8>)>>>,
    inserts: Arc<Mutex<Vec<(String, Value)>>>,
    polls: Arc<Mutex<u32>>,
}

async fn handle_upload(
    State(state): State<BackendState>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state
        .uploads
        .lock()
        .await
        .insert(format!("{bucket}/{key}"), (content_type, body.to_vec()));
    Json(json!({ "Key": format!("{bucket}/{key}") }))
}

async fn handle_insert(
    State(state): State<BackendState>,
    Path(table): Path<String>,
    Json(row): Json<Value>,
) -> StatusCode {
    state.inserts.lock().await.push((table, row));
    StatusCode::CREATED
}

async fn handle_create_prediction(State(_state): State<BackendState>) -> impl IntoResponse {
    (
        StatusCode::CREATED,
        Json(json!({ "id": "pred-acceptance", "status": "starting" })),
    )
}

async fn handle_fetch_prediction(
    State(state): State<BackendState>,
    Path(_id): Path<String>,
) -> Json<Value> {
    let mut polls = state.polls.lock().await;
    *polls += 1;
    if *polls == 1 {
        Json(json!({ "id": "pred-acceptance", "status": "processing" }))
    } else {
        Json(json!({
            "id": "pred-acceptance",
            "status": "succeeded",
            "output": [format!("{}/generated/result.png", state.base_url)],
        }))
    }
}

async fn handle_result_image() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "image/png")], RESULT_PNG.to_vec())
}

async fn spawn_backend() -> (String, BackendState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let base_url = format!("http://{addr}");
    let state = BackendState {
        base_url: base_url.clone(),
        uploads: Arc::new(Mutex::new(HashMap::new())),
        inserts: Arc::new(Mutex::new(Vec::new())),
        polls: Arc::new(Mutex::new(0)),
    };
    let app = Router::new()
        .route("/storage/v1/object/:bucket/*key", post(handle_upload))
        .route("/rest/v1/:table", post(handle_insert))
        .route("/v1/predictions", post(handle_create_prediction))
        .route("/v1/predictions/:id", get(handle_fetch_prediction))
        .route("/generated/result.png", get(handle_result_image))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (base_url, state)
}

struct InMemoryPhoto {
    bytes: Vec<u8>,
}

#[async_trait]
impl ImageSource for InMemoryPhoto {
    fn file_name(&self) -> &str {
        "fitting-room.jpg"
    }

    fn content_type(&self) -> &str {
        "image/jpeg"
    }

    fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    async fn read_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.bytes.clone())
    }
}

#[tokio::test]
async fn photo_upload_compose_and_history_round_trip_acceptance() {
    let (base_url, backend) = spawn_backend().await;

    let store = SupabaseStore::new(SupabaseConfig::new(&base_url, "acceptance-service-key"))
        .expect("supabase store");
    let compositor = Arc::new(ReplicateCompositor::new(ReplicateConfig {
        api_token: Some("acceptance-token".to_string()),
        api_base_url: base_url.clone(),
        model_version: "cuuupid/idm-vton:abc123".to_string(),
        poll_interval: Duration::from_millis(5),
    }));
    let auth = Arc::new(StaticAuthSession::signed_in(Identity {
        id: OperatorId("op-9".to_string()),
        display_name: "Noor".to_string(),
    }));
    let session = TryOnSession::with_collaborators(
        DressSummary {
            dress_id: DressId("dress-velvet-22".to_string()),
            name: "Velvet Wrap Dress".to_string(),
            image_urls: vec![format!("{base_url}/catalog/velvet-22.jpg")],
            price_cents: 23900,
        },
        ComposeOptions::default(),
        store.clone(),
        compositor,
        store.clone(),
        auth,
        Arc::new(MissingSharePresenter),
    );

    let photo = InMemoryPhoto {
        bytes: vec![0xD8; 1536],
    };
    let outcome = session.select_image(&photo).await.expect("select photo");
    assert!(matches!(outcome, SelectionOutcome::Applied(_)));

    let completed = session.start_try_on().await.expect("try-on");
    assert_eq!(session.phase().await, SessionPhase::ResultReady);
    assert_eq!(
        completed.result_image_url,
        format!("{base_url}/generated/result.png")
    );

    let uploads = backend.uploads.lock().await;
    assert_eq!(uploads.len(), 1);
    let (stored_key, (content_type, stored_bytes)) =
        uploads.iter().next().expect("one stored photo");
    assert!(stored_key.starts_with("try-on-images/customer-images/op-9/"));
    assert!(stored_key.ends_with(".jpg"));
    assert_eq!(content_type, "image/jpeg");
    assert_eq!(stored_bytes, &photo.bytes);
    assert_eq!(
        completed.input_image_url,
        format!("{base_url}/storage/v1/object/public/{stored_key}")
    );
    drop(uploads);

    let inserts = backend.inserts.lock().await;
    assert_eq!(inserts.len(), 1);
    let (table, row) = &inserts[0];
    assert_eq!(table, "try_ons");
    assert_eq!(row["operator_id"], "op-9");
    assert_eq!(row["dress_id"], "dress-velvet-22");
    assert_eq!(row["input_image_url"], completed.input_image_url.as_str());
    assert_eq!(row["result_image_url"], completed.result_image_url.as_str());
    assert_eq!(row["status"], "completed");
    drop(inserts);

    assert!(*backend.polls.lock().await >= 2);

    let downloaded = session.download().await.expect("download result");
    assert_eq!(downloaded.bytes, RESULT_PNG);
    assert_eq!(downloaded.content_type, "image/png");
    assert!(downloaded
        .file_name
        .starts_with("virtual-tryon-velvet-wrap-dress-"));
    assert!(downloaded.file_name.ends_with(".png"));
}
