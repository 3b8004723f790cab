use super::*;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::Mutex};

#[derive(Clone, Default)]
struct SupabaseServerState {
    uploads: Arc<Mutex<Vec<RecordedUpload>>>,
    inserts: Arc<Mutex<Vec<RecordedInsert>>>,
    upload_status: Arc<Mutex<Option<(u16, String)>>>,
    rest_status: Arc<Mutex<u16>>,
}

#[derive(Debug, Clone)]
struct RecordedUpload {
    bucket: String,
    key: String,
    content_type: Option<String>,
    upsert: Option<String>,
    authorization: Option<String>,
    apikey: Option<String>,
    body_len: usize,
}

#[derive(Debug, Clone)]
struct RecordedInsert {
    table: String,
    prefer: Option<String>,
    row: Value,
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

async fn handle_upload(
    State(state): State<SupabaseServerState>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    state.uploads.lock().await.push(RecordedUpload {
        bucket,
        key,
        content_type: header_value(&headers, "content-type"),
        upsert: header_value(&headers, "x-upsert"),
        authorization: header_value(&headers, "authorization"),
        apikey: header_value(&headers, "apikey"),
        body_len: body.len(),
    });
    if let Some((status, detail)) = state.upload_status.lock().await.clone() {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (status, detail);
    }
    (StatusCode::OK, String::new())
}

async fn handle_insert(
    State(state): State<SupabaseServerState>,
    Path(table): Path<String>,
    headers: HeaderMap,
    Json(row): Json<Value>,
) -> StatusCode {
    state.inserts.lock().await.push(RecordedInsert {
        table,
        prefer: header_value(&headers, "prefer"),
        row,
    });
    StatusCode::CREATED
}

async fn handle_rest_root(State(state): State<SupabaseServerState>) -> StatusCode {
    StatusCode::from_u16(*state.rest_status.lock().await).unwrap_or(StatusCode::OK)
}

async fn spawn_supabase_server() -> (String, SupabaseServerState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let state = SupabaseServerState {
        rest_status: Arc::new(Mutex::new(200)),
        ..SupabaseServerState::default()
    };
    let app = Router::new()
        .route("/storage/v1/object/:bucket/*key", post(handle_upload))
        .route("/rest/v1/", get(handle_rest_root))
        .route("/rest/v1/:table", post(handle_insert))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

fn client_for(server_url: &str) -> SupabaseClient {
    SupabaseClient::new(SupabaseConfig::new(server_url, "service-key")).expect("client")
}

#[tokio::test]
async fn upload_sends_bucket_scoped_request_with_upsert_header() {
    let (server_url, state) = spawn_supabase_server().await;
    let client = client_for(&server_url);

    client
        .upload_object(
            "customer-images/op-1/1700000000000.jpg",
            vec![0xAB; 64],
            "image/jpeg",
            false,
        )
        .await
        .expect("upload");

    let uploads = state.uploads.lock().await;
    assert_eq!(uploads.len(), 1);
    let upload = &uploads[0];
    assert_eq!(upload.bucket, "try-on-images");
    assert_eq!(upload.key, "customer-images/op-1/1700000000000.jpg");
    assert_eq!(upload.content_type.as_deref(), Some("image/jpeg"));
    assert_eq!(upload.upsert.as_deref(), Some("false"));
    assert_eq!(upload.authorization.as_deref(), Some("Bearer service-key"));
    assert_eq!(upload.apikey.as_deref(), Some("service-key"));
    assert_eq!(upload.body_len, 64);
}

#[tokio::test]
async fn upload_conflict_reports_overwrite_disabled() {
    let (server_url, state) = spawn_supabase_server().await;
    *state.upload_status.lock().await = Some((409, "Duplicate".to_string()));

    let err = client_for(&server_url)
        .upload_object("customer-images/op-1/1.jpg", vec![1], "image/jpeg", false)
        .await
        .expect_err("upload should fail");
    assert!(
        err.to_string().contains("already exists"),
        "unexpected message: {err}"
    );
}

#[tokio::test]
async fn upload_failure_includes_status_and_detail() {
    let (server_url, state) = spawn_supabase_server().await;
    *state.upload_status.lock().await = Some((400, "invalid bucket".to_string()));

    let err = client_for(&server_url)
        .upload_object("customer-images/op-1/1.jpg", vec![1], "image/jpeg", true)
        .await
        .expect_err("upload should fail");
    let message = err.to_string();
    assert!(message.contains("400"), "unexpected message: {message}");
    assert!(
        message.contains("invalid bucket"),
        "unexpected message: {message}"
    );
}

#[tokio::test]
async fn insert_row_posts_json_with_minimal_return() {
    let (server_url, state) = spawn_supabase_server().await;
    let client = client_for(&server_url);

    client
        .insert_row(
            client.records_table(),
            &json!({
                "operator_id": "op-1",
                "dress_id": "dress-9",
                "status": "completed",
            }),
        )
        .await
        .expect("insert");

    let inserts = state.inserts.lock().await;
    assert_eq!(inserts.len(), 1);
    assert_eq!(inserts[0].table, "try_ons");
    assert_eq!(inserts[0].prefer.as_deref(), Some("return=minimal"));
    assert_eq!(inserts[0].row["operator_id"], "op-1");
    assert_eq!(inserts[0].row["status"], "completed");
}

#[test]
fn public_object_url_points_at_public_storage_path() {
    let client = SupabaseClient::new(SupabaseConfig::new(
        "https://demo.supabase.co/",
        "service-key",
    ))
    .expect("client");

    assert_eq!(
        client.public_object_url("customer-images/op-1/1.jpg"),
        "https://demo.supabase.co/storage/v1/object/public/try-on-images/customer-images/op-1/1.jpg"
    );
}

#[test]
fn rejects_bad_configuration() {
    assert!(SupabaseClient::new(SupabaseConfig::new("not a url", "key")).is_err());
    assert!(SupabaseClient::new(SupabaseConfig::new("https://demo.supabase.co", "  ")).is_err());
}

#[tokio::test]
async fn health_check_round_trip() {
    let (server_url, state) = spawn_supabase_server().await;
    let client = client_for(&server_url);

    client.health_check().await.expect("healthy");

    *state.rest_status.lock().await = 500;
    assert!(client.health_check().await.is_err());
}
