//! In-process stand-ins for Supabase, Stripe, RevenueCat, ElevenLabs and the
//! image provider, plus helpers for driving the router in tests.

use std::{cmp::Ordering, collections::HashMap, sync::Arc};

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header::CONTENT_TYPE, HeaderMap, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use sha2::Sha256;
use tokio::net::TcpListener;
use tower::ServiceExt;

use crate::{config::Config, state::AppState, supabase::SupabaseClient};

pub const SERVICE_ROLE_KEY: &str = "service-role-test";
pub const STRIPE_SECRET_KEY: &str = "sk_test_fake";
pub const WEBHOOK_SECRET: &str = "whsec_test_fake";
pub const REVENUECAT_KEY: &str = "rc_test_fake";
pub const ELEVENLABS_KEY: &str = "xi_test_fake";
pub const OPENAI_KEY: &str = "sk-openai-test";

pub const FAKE_AUDIO: &[u8] = b"ID3\x04\x00\x00fake-mpeg-frames";
pub const FAKE_PNG: &[u8] = &[
    0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, b'I', b'H', b'D', b'R',
];

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    (listener, base_url)
}

fn serve(listener: TcpListener, router: Router) {
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
}

fn bearer_matches(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        == Some(expected)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "message": "invalid credentials" })),
    )
        .into_response()
}

/// Signs a webhook payload the way Stripe does, producing a `Stripe-Signature` header value.
pub fn sign_stripe_payload(secret: &str, payload: &[u8], timestamp: i64) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    )
}

/// Sends a request with an optional JSON body. `Value::Null` sends no body;
/// non-JSON responses come back as `Value::Null`.
pub async fn send_json(
    router: &Router,
    method: Method,
    uri: &str,
    body: Value,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = if body.is_null() {
        Body::empty()
    } else {
        builder = builder.header(CONTENT_TYPE, "application/json");
        Body::from(body.to_string())
    };

    let response = router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = read_body(response).await;
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

pub async fn read_body(response: Response) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

// Supabase (PostgREST + Storage)

#[derive(Default)]
struct SupabaseData {
    tables: HashMap<String, Vec<Value>>,
    objects: HashMap<String, (String, Vec<u8>)>,
    requests: usize,
}

#[derive(Clone)]
pub struct FakeSupabase {
    pub base_url: String,
    data: Arc<Mutex<SupabaseData>>,
}

impl FakeSupabase {
    pub async fn start() -> Self {
        let (listener, base_url) = bind().await;
        let fake = Self {
            base_url,
            data: Arc::new(Mutex::new(SupabaseData::default())),
        };

        let router = Router::new()
            .route("/rest/v1/", get(|| async { Json(json!({})) }))
            .route(
                "/rest/v1/{table}",
                get(select_rows).post(upsert_rows).patch(update_rows),
            )
            .route("/storage/v1/object/{*path}", post(upload_object))
            .with_state(fake.clone());
        serve(listener, router);
        fake
    }

    pub fn client(&self) -> SupabaseClient {
        SupabaseClient::new(self.base_url.clone(), Some(SERVICE_ROLE_KEY)).unwrap()
    }

    /// Seeds a row without counting it as a request.
    pub fn insert(&self, table: &str, row: Value) {
        self.data
            .lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.data
            .lock()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn tier_of(&self, user_id: &str) -> Option<String> {
        self.rows("artist_profiles")
            .into_iter()
            .find(|row| row["user_id"] == user_id)
            .and_then(|row| row["subscription_tier"].as_str().map(ToString::to_string))
    }

    /// Stored objects keyed by `bucket/path`.
    pub fn objects(&self) -> HashMap<String, (String, Vec<u8>)> {
        self.data.lock().objects.clone()
    }

    /// REST and storage calls received so far, reads included.
    pub fn request_count(&self) -> usize {
        self.data.lock().requests
    }
}

fn supabase_authorized(headers: &HeaderMap) -> bool {
    headers.get("apikey").and_then(|value| value.to_str().ok()) == Some(SERVICE_ROLE_KEY)
        && bearer_matches(headers, SERVICE_ROLE_KEY)
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn matches_filters(row: &Value, query: &[(String, String)]) -> bool {
    query.iter().all(|(column, filter)| {
        if matches!(column.as_str(), "select" | "order" | "limit" | "on_conflict") {
            return true;
        }
        match filter.strip_prefix("eq.") {
            Some(expected) => cell_text(&row[column.as_str()]) == expected,
            None => true,
        }
    })
}

fn query_param<'a>(query: &'a [(String, String)], name: &str) -> Option<&'a str> {
    query
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn merge_into(target: &mut Value, patch: &Value) {
    if let (Some(target), Some(patch)) = (target.as_object_mut(), patch.as_object()) {
        for (key, value) in patch {
            target.insert(key.clone(), value.clone());
        }
    }
}

async fn select_rows(
    State(fake): State<FakeSupabase>,
    Path(table): Path<String>,
    headers: HeaderMap,
    Query(query): Query<Vec<(String, String)>>,
) -> Response {
    if !supabase_authorized(&headers) {
        return unauthorized();
    }

    let mut data = fake.data.lock();
    data.requests += 1;
    let mut rows: Vec<Value> = data
        .tables
        .get(&table)
        .map(|rows| {
            rows.iter()
                .filter(|row| matches_filters(row, &query))
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    if let Some(order) = query_param(&query, "order") {
        let (column, direction) = order.split_once('.').unwrap_or((order, "asc"));
        rows.sort_by(|left, right| {
            let ordering = match (&left[column], &right[column]) {
                (Value::Null, Value::Null) => Ordering::Equal,
                (Value::Null, _) => Ordering::Less,
                (_, Value::Null) => Ordering::Greater,
                (left, right) => cell_text(left).cmp(&cell_text(right)),
            };
            if direction == "desc" {
                ordering.reverse()
            } else {
                ordering
            }
        });
    }
    if let Some(limit) = query_param(&query, "limit").and_then(|value| value.parse().ok()) {
        rows.truncate(limit);
    }

    Json(Value::Array(rows)).into_response()
}

async fn upsert_rows(
    State(fake): State<FakeSupabase>,
    Path(table): Path<String>,
    headers: HeaderMap,
    Query(query): Query<Vec<(String, String)>>,
    Json(incoming): Json<Vec<Value>>,
) -> Response {
    if !supabase_authorized(&headers) {
        return unauthorized();
    }

    let conflict_columns: Vec<String> = query_param(&query, "on_conflict")
        .unwrap_or_default()
        .split(',')
        .filter(|column| !column.is_empty())
        .map(ToString::to_string)
        .collect();

    let mut data = fake.data.lock();
    data.requests += 1;
    let rows = data.tables.entry(table).or_default();
    let mut written = Vec::new();

    for row in incoming {
        let existing = rows.iter_mut().find(|candidate| {
            !conflict_columns.is_empty()
                && conflict_columns
                    .iter()
                    .all(|column| candidate[column.as_str()] == row[column.as_str()])
        });
        match existing {
            Some(existing) => {
                merge_into(existing, &row);
                written.push(existing.clone());
            }
            None => {
                rows.push(row.clone());
                written.push(row);
            }
        }
    }

    (StatusCode::CREATED, Json(Value::Array(written))).into_response()
}

async fn update_rows(
    State(fake): State<FakeSupabase>,
    Path(table): Path<String>,
    headers: HeaderMap,
    Query(query): Query<Vec<(String, String)>>,
    Json(patch): Json<Value>,
) -> Response {
    if !supabase_authorized(&headers) {
        return unauthorized();
    }

    let mut data = fake.data.lock();
    data.requests += 1;
    let mut updated = Vec::new();
    if let Some(rows) = data.tables.get_mut(&table) {
        for row in rows.iter_mut().filter(|row| matches_filters(row, &query)) {
            merge_into(row, &patch);
            updated.push(row.clone());
        }
    }

    Json(Value::Array(updated)).into_response()
}

async fn upload_object(
    State(fake): State<FakeSupabase>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !supabase_authorized(&headers) {
        return unauthorized();
    }

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let mut data = fake.data.lock();
    data.requests += 1;
    data.objects
        .insert(path.clone(), (content_type, body.to_vec()));

    Json(json!({ "Key": path })).into_response()
}

// Stripe

#[derive(Clone)]
pub struct FakeStripe {
    pub base_url: String,
    objects: Arc<Mutex<HashMap<String, Value>>>,
}

impl FakeStripe {
    pub async fn start() -> Self {
        let (listener, base_url) = bind().await;
        let fake = Self {
            base_url,
            objects: Arc::new(Mutex::new(HashMap::new())),
        };

        let router = Router::new()
            .route("/v1/{*path}", get(stripe_object))
            .with_state(fake.clone());
        serve(listener, router);
        fake
    }

    /// Registers an object under its API path, e.g. `customers/cus_1`.
    pub fn put(&self, path: &str, object: Value) {
        self.objects.lock().insert(path.to_string(), object);
    }
}

async fn stripe_object(
    State(fake): State<FakeStripe>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !bearer_matches(&headers, STRIPE_SECRET_KEY) {
        return unauthorized();
    }

    match fake.objects.lock().get(&path) {
        Some(object) => Json(object.clone()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": { "type": "invalid_request_error", "message": format!("No such object: '{}'", path) }
            })),
        )
            .into_response(),
    }
}

// RevenueCat

struct RevenueCatData {
    subscribers: HashMap<String, Value>,
    create_on_get: bool,
    fail_status: Option<u16>,
    fail_receipts: bool,
    receipts: Vec<Value>,
    attributes: Vec<(String, Value)>,
}

#[derive(Clone)]
pub struct FakeRevenueCat {
    pub base_url: String,
    data: Arc<Mutex<RevenueCatData>>,
}

impl FakeRevenueCat {
    pub async fn start() -> Self {
        let (listener, base_url) = bind().await;
        let fake = Self {
            base_url,
            data: Arc::new(Mutex::new(RevenueCatData {
                subscribers: HashMap::new(),
                create_on_get: true,
                fail_status: None,
                fail_receipts: false,
                receipts: Vec::new(),
                attributes: Vec::new(),
            })),
        };

        let router = Router::new()
            .route("/v1/subscribers/{id}", get(revenuecat_subscriber))
            .route("/v1/subscribers/{id}/attributes", post(revenuecat_attributes))
            .route("/v1/receipts", post(revenuecat_receipt))
            .with_state(fake.clone());
        serve(listener, router);
        fake
    }

    pub fn put_subscriber(&self, app_user_id: &str, subscriber: Value) {
        self.data
            .lock()
            .subscribers
            .insert(app_user_id.to_string(), subscriber);
    }

    /// When false, unknown app user ids answer 404 instead of being created.
    pub fn set_create_on_get(&self, create: bool) {
        self.data.lock().create_on_get = create;
    }

    /// Makes every endpoint answer with `status`.
    pub fn fail_with(&self, status: u16) {
        self.data.lock().fail_status = Some(status);
    }

    pub fn fail_receipts(&self, fail: bool) {
        self.data.lock().fail_receipts = fail;
    }

    pub fn receipts(&self) -> Vec<Value> {
        self.data.lock().receipts.clone()
    }

    pub fn attributes(&self) -> Vec<(String, Value)> {
        self.data.lock().attributes.clone()
    }
}

fn empty_subscriber(app_user_id: &str) -> Value {
    json!({
        "original_app_user_id": app_user_id,
        "first_seen": Utc::now().to_rfc3339(),
        "management_url": null,
        "entitlements": {},
        "subscriptions": {}
    })
}

fn subscriber_response(subscriber: Value) -> Response {
    Json(json!({
        "request_date": Utc::now().to_rfc3339(),
        "subscriber": subscriber
    }))
    .into_response()
}

fn revenuecat_failure(data: &RevenueCatData, headers: &HeaderMap) -> Option<Response> {
    if !bearer_matches(headers, REVENUECAT_KEY) {
        return Some(unauthorized());
    }
    data.fail_status.map(|status| {
        (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(json!({ "code": 7110, "message": "upstream failure" })),
        )
            .into_response()
    })
}

async fn revenuecat_subscriber(
    State(fake): State<FakeRevenueCat>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let mut data = fake.data.lock();
    if let Some(response) = revenuecat_failure(&data, &headers) {
        return response;
    }

    if !data.subscribers.contains_key(&id) {
        if !data.create_on_get {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "code": 7259, "message": "Subscriber not found" })),
            )
                .into_response();
        }
        data.subscribers.insert(id.clone(), empty_subscriber(&id));
    }

    subscriber_response(data.subscribers[&id].clone())
}

async fn revenuecat_attributes(
    State(fake): State<FakeRevenueCat>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut data = fake.data.lock();
    if let Some(response) = revenuecat_failure(&data, &headers) {
        return response;
    }

    data.attributes.push((id, body));
    Json(json!({})).into_response()
}

async fn revenuecat_receipt(
    State(fake): State<FakeRevenueCat>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut data = fake.data.lock();
    if let Some(response) = revenuecat_failure(&data, &headers) {
        return response;
    }
    if data.fail_receipts {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "code": 7712, "message": "The receipt is not valid." })),
        )
            .into_response();
    }

    let app_user_id = body["app_user_id"].as_str().unwrap_or_default().to_string();
    let product = body["product_id"]
        .as_str()
        .unwrap_or("artist_monthly")
        .to_string();
    data.receipts.push(body);

    let now = Utc::now();
    let expires = (now + Duration::days(30)).to_rfc3339();
    let subscriber = data
        .subscribers
        .entry(app_user_id.clone())
        .or_insert_with(|| empty_subscriber(&app_user_id));
    subscriber["entitlements"]["artist"] = json!({
        "expires_date": expires,
        "purchase_date": now.to_rfc3339(),
        "product_identifier": product,
    });
    subscriber["subscriptions"][product.as_str()] = json!({
        "expires_date": expires,
        "purchase_date": now.to_rfc3339(),
        "store": "stripe",
        "unsubscribe_detected_at": null,
    });

    subscriber_response(subscriber.clone())
}

// ElevenLabs

#[derive(Clone)]
pub struct FakeElevenLabs {
    pub base_url: String,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl FakeElevenLabs {
    pub async fn start() -> Self {
        let (listener, base_url) = bind().await;
        let fake = Self {
            base_url,
            calls: Arc::new(Mutex::new(Vec::new())),
        };

        let router = Router::new()
            .route("/v1/text-to-speech/{voice_id}", post(elevenlabs_speech))
            .route("/v1/voices", get(elevenlabs_voices))
            .with_state(fake.clone());
        serve(listener, router);
        fake
    }

    /// Synthesis requests as `(voice_id, body)`.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }
}

fn elevenlabs_authorized(headers: &HeaderMap) -> bool {
    headers.get("xi-api-key").and_then(|value| value.to_str().ok()) == Some(ELEVENLABS_KEY)
}

async fn elevenlabs_speech(
    State(fake): State<FakeElevenLabs>,
    Path(voice_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !elevenlabs_authorized(&headers) {
        return unauthorized();
    }

    fake.calls.lock().push((voice_id, body));
    ([(CONTENT_TYPE, "audio/mpeg")], FAKE_AUDIO).into_response()
}

async fn elevenlabs_voices(headers: HeaderMap) -> Response {
    if !elevenlabs_authorized(&headers) {
        return unauthorized();
    }

    Json(json!({
        "voices": [
            {
                "voice_id": "voice-a",
                "name": "Aria",
                "category": "premade",
                "labels": { "accent": "american" }
            },
            {
                "voice_id": "voice-b",
                "name": "Bram",
                "category": "cloned"
            }
        ]
    }))
    .into_response()
}

// Image generation

#[derive(Clone)]
pub struct FakeImages {
    pub base_url: String,
    inline: Arc<Mutex<bool>>,
}

impl FakeImages {
    pub async fn start() -> Self {
        let (listener, base_url) = bind().await;
        let fake = Self {
            base_url,
            inline: Arc::new(Mutex::new(false)),
        };

        let router = Router::new()
            .route("/v1/images/generations", post(generate_image))
            .route(
                "/files/cover.png",
                get(|| async { ([(CONTENT_TYPE, "image/png")], FAKE_PNG) }),
            )
            .route(
                "/files/page.html",
                get(|| async { ([(CONTENT_TYPE, "text/html")], "<html></html>") }),
            )
            .with_state(fake.clone());
        serve(listener, router);
        fake
    }

    /// Answer generations with base64 data instead of a temporary URL.
    pub fn return_inline(&self, inline: bool) {
        *self.inline.lock() = inline;
    }
}

async fn generate_image(State(fake): State<FakeImages>, headers: HeaderMap) -> Response {
    if !bearer_matches(&headers, OPENAI_KEY) {
        return unauthorized();
    }

    let mut item = Map::new();
    if *fake.inline.lock() {
        item.insert("b64_json".into(), json!(STANDARD.encode(FAKE_PNG)));
    } else {
        item.insert(
            "url".into(),
            json!(format!("{}/files/cover.png", fake.base_url)),
        );
    }
    Json(json!({ "created": Utc::now().timestamp(), "data": [item] })).into_response()
}

// Harness

pub struct TestHarness {
    pub supabase: FakeSupabase,
    pub stripe: FakeStripe,
    pub revenuecat: FakeRevenueCat,
    pub elevenlabs: FakeElevenLabs,
    pub images: FakeImages,
}

impl TestHarness {
    pub async fn start() -> Self {
        Self {
            supabase: FakeSupabase::start().await,
            stripe: FakeStripe::start().await,
            revenuecat: FakeRevenueCat::start().await,
            elevenlabs: FakeElevenLabs::start().await,
            images: FakeImages::start().await,
        }
    }

    /// Fully configured, with every provider pointed at its fake.
    pub fn config(&self) -> Config {
        Config {
            port: 0,
            trust_proxy: false,
            tls_key_path: None,
            tls_cert_path: None,
            supabase_url: self.supabase.base_url.clone(),
            supabase_service_role_key: Some(SERVICE_ROLE_KEY.to_string()),
            cover_art_bucket: "cover-art".to_string(),
            stripe_secret_key: Some(STRIPE_SECRET_KEY.to_string()),
            stripe_webhook_secret: Some(WEBHOOK_SECRET.to_string()),
            stripe_api_base: format!("{}/v1", self.stripe.base_url),
            stripe_webhook_tolerance_secs: 300,
            revenuecat_api_key: Some(REVENUECAT_KEY.to_string()),
            revenuecat_product_id: Some("artist_monthly".to_string()),
            revenuecat_api_base: format!("{}/v1", self.revenuecat.base_url),
            elevenlabs_api_key: Some(ELEVENLABS_KEY.to_string()),
            elevenlabs_api_base: format!("{}/v1", self.elevenlabs.base_url),
            elevenlabs_default_voice_id: "voice-default".to_string(),
            elevenlabs_model_id: "eleven_multilingual_v2".to_string(),
            openai_api_key: Some(OPENAI_KEY.to_string()),
            image_api_base: format!("{}/v1", self.images.base_url),
            image_model: "dall-e-3".to_string(),
            image_download_hosts: vec![self.images.base_url.trim_start_matches("http://").to_string()],
            ai_rate_limit_max: 100,
        }
    }

    pub fn router(&self) -> Router {
        self.router_with(self.config())
    }

    pub fn router_with(&self, config: Config) -> Router {
        crate::build_router(AppState::from_config(config).unwrap())
    }
}
