use std::collections::HashMap;

use axum::{
    extract::{rejection::JsonRejection, Json, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{
    elevenlabs::VoiceSettingsOverrides,
    ids::clean_identifier,
    images::{extension_for, GeneratedImage},
    revenuecat::{Entitlement, RevenueCatError, Subscriber},
    state::AppState,
    store::{self, SubscriptionRecord, SubscriptionWrite, SyncOutcome},
    stripe_api::Expandable,
    tier::ArtistTier,
};

#[derive(Debug, Deserialize)]
pub struct EntitlementCheckRequest {
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LinkCheckoutRequest {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DebugSubscriptionRequest {
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GenerateVoiceRequest {
    pub prompt: Option<String>,
    pub voice_id: Option<String>,
    pub voice_settings: Option<VoiceSettingsOverrides>,
    pub speed: Option<f32>,
}

#[derive(Debug, Deserialize)]
pub struct GenerateCoverArtRequest {
    pub prompt: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PersistCoverArtRequest {
    pub image_url: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct EntitlementCheckResponse {
    has_artist_entitlement: bool,
    entitlements: HashMap<String, Entitlement>,
    subscriber: Option<Subscriber>,
    expires_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

#[derive(Debug, Serialize)]
struct LinkCheckoutResponse {
    success: bool,
    message: &'static str,
    customer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

#[derive(Debug, Serialize)]
struct DebugSubscriptionResponse {
    user_id: String,
    local: LocalSubscriptionView,
    remote: RemoteSubscriberView,
    diverged: bool,
    repaired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    repair_error: Option<String>,
}

#[derive(Debug, Serialize)]
struct LocalSubscriptionView {
    customer_id: Option<String>,
    subscription: Option<SubscriptionRecord>,
    tier: Option<ArtistTier>,
}

#[derive(Debug, Serialize)]
struct RemoteSubscriberView {
    found: bool,
    has_active_entitlement: bool,
    subscriber: Option<Subscriber>,
}

pub async fn health(State(state): State<AppState>) -> Response {
    let providers = json!({
        "stripe": state.stripe.is_configured(),
        "revenuecat": state.revenuecat.is_configured(),
        "elevenlabs": state.elevenlabs.is_configured(),
        "images": state.images.is_configured(),
    });

    match state.supabase.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "datastore": "ok", "providers": providers })),
        )
            .into_response(),
        Err(error) => {
            tracing::error!(error = %error, "failed to reach Supabase");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "status": "degraded",
                    "datastore": error.to_string(),
                    "providers": providers,
                })),
            )
                .into_response()
        }
    }
}

pub async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

/// Reports whether a user holds any live entitlement. Always answers 200 so
/// the front end can treat failures as "no access".
pub async fn check_entitlement(
    State(state): State<AppState>,
    payload: Result<Json<EntitlementCheckRequest>, JsonRejection>,
) -> Response {
    let user_id = payload.ok().and_then(|Json(body)| body.user_id);
    let user_id = match clean_identifier(user_id.as_deref()) {
        Some(value) => value.to_string(),
        None => {
            return degraded_entitlement("missing_user_id", Some("user_id is required".into()))
        }
    };

    if !state.revenuecat.is_configured() {
        tracing::warn!("entitlement check without REVENUECAT_API_KEY");
        return degraded_entitlement("not_configured", None);
    }

    let subscriber = match state.revenuecat.get_subscriber(&user_id).await {
        Ok(subscriber) => subscriber,
        Err(RevenueCatError::NotFound) => {
            tracing::info!(user_id = %user_id, "no RevenueCat subscriber");
            return degraded_entitlement("subscriber_not_found", None);
        }
        Err(RevenueCatError::NotConfigured) => {
            return degraded_entitlement("not_configured", None);
        }
        Err(error) => {
            tracing::error!(error = %error, user_id = %user_id, "RevenueCat entitlement lookup failed");
            return degraded_entitlement("provider_error", Some(error.to_string()));
        }
    };

    let now = Utc::now();
    let body = EntitlementCheckResponse {
        has_artist_entitlement: subscriber.has_active_entitlement(now),
        expires_date: subscriber.latest_active_expiry(now),
        entitlements: subscriber.entitlements.clone(),
        subscriber: Some(subscriber),
        reason: None,
        details: None,
    };
    (StatusCode::OK, Json(body)).into_response()
}

pub async fn link_checkout(
    State(state): State<AppState>,
    payload: Result<Json<LinkCheckoutRequest>, JsonRejection>,
) -> Response {
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => return bad_request(&rejection.body_text()),
    };

    let (session_id, user_id) = match (
        clean_identifier(body.session_id.as_deref()),
        clean_identifier(body.user_id.as_deref()),
    ) {
        (Some(session_id), Some(user_id)) => (session_id.to_string(), user_id.to_string()),
        _ => return bad_request("session_id and user_id are required"),
    };

    if !state.stripe.is_configured() {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Stripe is not configured",
            None,
        );
    }

    let session = match state.stripe.retrieve_checkout_session(&session_id).await {
        Ok(session) => session,
        Err(error) => {
            tracing::error!(error = %error, session_id = %session_id, "failed to retrieve checkout session");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to retrieve checkout session",
                Some(format!("{:#}", error)),
            );
        }
    };

    let customer_id = match session.customer.as_ref().map(Expandable::id) {
        Some(value) => value.to_string(),
        None => return bad_request("Checkout session has no customer"),
    };

    let customer = match store::upsert_customer(&state.supabase, &customer_id, Some(&user_id)).await
    {
        Ok(customer) => customer,
        Err(error) => {
            tracing::error!(error = %error, customer_id = %customer_id, "failed to link customer");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to link customer",
                Some(format!("{:#}", error)),
            );
        }
    };

    let subscription = session
        .subscription
        .as_ref()
        .and_then(Expandable::as_object);
    if let Some(subscription) = subscription {
        let (period_start, period_end) = subscription.period();
        let write = SubscriptionWrite {
            customer_id: customer_id.clone(),
            subscription_id: subscription.id.clone(),
            status: subscription.status.clone(),
            period_start,
            period_end,
            cancel_at_period_end: Some(subscription.cancel_at_period_end),
            event_created: None,
        };
        match store::sync_subscription(&state.supabase, &customer, &write).await {
            Ok(SyncOutcome::Applied { tier, .. }) => {
                tracing::info!(user_id = %user_id, tier = tier.as_str(), "linked checkout subscription");
            }
            Ok(SyncOutcome::Stale { .. }) => {}
            Err(error) => {
                tracing::error!(error = %error, customer_id = %customer_id, "failed to store checkout subscription");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to store subscription",
                    Some(format!("{:#}", error)),
                );
            }
        }
    }

    let fetch_token = session
        .subscription
        .as_ref()
        .map(|subscription| subscription.id().to_string())
        .unwrap_or_else(|| session.id.clone());

    let warning = match mirror_purchase(
        &state,
        &user_id,
        &fetch_token,
        &customer_id,
        session.email(),
    )
    .await
    {
        Ok(()) => None,
        Err(error) => {
            tracing::warn!(error = %error, user_id = %user_id, "RevenueCat sync failed after checkout link");
            Some(format!("Customer linked, but RevenueCat sync failed: {}", error))
        }
    };

    (
        StatusCode::OK,
        Json(LinkCheckoutResponse {
            success: true,
            message: "Checkout session linked",
            customer_id,
            warning,
        }),
    )
        .into_response()
}

/// Compares local and RevenueCat subscription state for a user and, when the
/// local side is active but RevenueCat has nothing, replays the purchase.
pub async fn debug_subscription(
    State(state): State<AppState>,
    payload: Result<Json<DebugSubscriptionRequest>, JsonRejection>,
) -> Response {
    let user_id = match payload {
        Ok(Json(body)) => body.user_id,
        Err(rejection) => return bad_request(&rejection.body_text()),
    };
    let user_id = match clean_identifier(user_id.as_deref()) {
        Some(value) => value.to_string(),
        None => return bad_request("user_id is required"),
    };

    if !state.revenuecat.is_configured() {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "RevenueCat is not configured",
            None,
        );
    }

    let local = match load_local_view(&state, &user_id).await {
        Ok(local) => local,
        Err(error) => {
            tracing::error!(error = %error, user_id = %user_id, "failed to read local subscription state");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read local subscription state",
                Some(format!("{:#}", error)),
            );
        }
    };

    let remote = match state.revenuecat.get_subscriber(&user_id).await {
        Ok(subscriber) => Some(subscriber),
        Err(RevenueCatError::NotFound) => None,
        Err(error) => {
            tracing::error!(error = %error, user_id = %user_id, "failed to read RevenueCat subscriber");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read RevenueCat subscriber",
                Some(error.to_string()),
            );
        }
    };

    let local_active = local
        .subscription
        .as_ref()
        .is_some_and(|subscription| subscription.status.is_active());
    let remote_has_record = remote.as_ref().is_some_and(Subscriber::has_any_record);
    let diverged = local_active && !remote_has_record;

    let mut repaired = false;
    let mut repair_error = None;
    let mut remote = remote;

    if diverged {
        tracing::warn!(user_id = %user_id, "local subscription active but RevenueCat has no record; repairing");
        match repair_remote(&state, &user_id, &local).await {
            Ok(subscriber) => {
                repaired = true;
                remote = Some(subscriber);
            }
            Err(error) => {
                tracing::error!(error = %error, user_id = %user_id, "RevenueCat repair failed");
                repair_error = Some(error.to_string());
            }
        }
    }

    let now = Utc::now();
    let remote_view = RemoteSubscriberView {
        found: remote.is_some(),
        has_active_entitlement: remote
            .as_ref()
            .is_some_and(|subscriber| subscriber.has_active_entitlement(now)),
        subscriber: remote,
    };

    (
        StatusCode::OK,
        Json(DebugSubscriptionResponse {
            user_id,
            local,
            remote: remote_view,
            diverged,
            repaired,
            repair_error,
        }),
    )
        .into_response()
}

pub async fn generate_voice(
    State(state): State<AppState>,
    payload: Result<Json<GenerateVoiceRequest>, JsonRejection>,
) -> Response {
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => return bad_request(&rejection.body_text()),
    };

    let prompt = match body.prompt.as_deref().map(str::trim) {
        Some(prompt) if !prompt.is_empty() => prompt.to_string(),
        _ => return bad_request("prompt is required"),
    };

    let voice_id = match body.voice_id.as_deref() {
        None => state.config.elevenlabs_default_voice_id.clone(),
        Some(raw) => match clean_identifier(Some(raw)) {
            Some(value) => value.to_string(),
            None => return bad_request("voice_id is invalid"),
        },
    };

    if !state.elevenlabs.is_configured() {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ElevenLabs is not configured",
            None,
        );
    }

    let settings = body.voice_settings.unwrap_or_default().resolve(body.speed);
    match state
        .elevenlabs
        .text_to_speech(&voice_id, &prompt, settings)
        .await
    {
        Ok(synthesized) => {
            let content_type = HeaderValue::from_str(&synthesized.content_type)
                .unwrap_or_else(|_| HeaderValue::from_static("audio/mpeg"));
            (
                StatusCode::OK,
                [(CONTENT_TYPE, content_type)],
                synthesized.audio,
            )
                .into_response()
        }
        Err(error) => {
            tracing::error!(error = %error, voice_id = %voice_id, "speech synthesis failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to generate audio",
                Some(format!("{:#}", error)),
            )
        }
    }
}

pub async fn list_voices(State(state): State<AppState>) -> Response {
    if !state.elevenlabs.is_configured() {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ElevenLabs is not configured",
            None,
        );
    }

    match state.elevenlabs.list_voices().await {
        Ok(voices) => (StatusCode::OK, Json(json!({ "voices": voices }))).into_response(),
        Err(error) => {
            tracing::error!(error = %error, "failed to list voices");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to list voices",
                Some(format!("{:#}", error)),
            )
        }
    }
}

/// First half of the cover-art flow: ask the image provider for artwork.
pub async fn generate_cover_art(
    State(state): State<AppState>,
    payload: Result<Json<GenerateCoverArtRequest>, JsonRejection>,
) -> Response {
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => return bad_request(&rejection.body_text()),
    };

    let prompt = match body.prompt.as_deref().map(str::trim) {
        Some(prompt) if !prompt.is_empty() => prompt.to_string(),
        _ => return bad_request("prompt is required"),
    };
    let owner = match owner_segment(body.user_id.as_deref()) {
        Ok(owner) => owner,
        Err(response) => return response,
    };

    if !state.images.is_configured() {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Image generation is not configured",
            None,
        );
    }

    let generated = match state.images.generate(&prompt).await {
        Ok(generated) => generated,
        Err(error) => {
            tracing::error!(error = %error, "cover art generation failed");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to generate cover art",
                Some(format!("{:#}", error)),
            );
        }
    };

    match generated {
        GeneratedImage::Temporary(url) => (
            StatusCode::OK,
            Json(json!({ "imageUrl": url, "temporary": true })),
        )
            .into_response(),
        GeneratedImage::Inline(bytes) => {
            let path = cover_art_path(&owner, extension_for("image/png"));
            match state
                .supabase
                .upload_object(&state.config.cover_art_bucket, &path, "image/png", bytes)
                .await
            {
                Ok(url) => (
                    StatusCode::OK,
                    Json(json!({ "imageUrl": url, "temporary": false })),
                )
                    .into_response(),
                Err(error) => {
                    tracing::error!(error = %error, "failed to store generated cover art");
                    error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Failed to store cover art",
                        Some(format!("{:#}", error)),
                    )
                }
            }
        }
    }
}

/// Second half of the cover-art flow: copy a temporary image into durable storage.
pub async fn persist_cover_art(
    State(state): State<AppState>,
    payload: Result<Json<PersistCoverArtRequest>, JsonRejection>,
) -> Response {
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => return bad_request(&rejection.body_text()),
    };

    let image_url = match body
        .image_url
        .as_deref()
        .map(str::trim)
        .and_then(|value| reqwest::Url::parse(value).ok())
    {
        Some(url) if matches!(url.scheme(), "http" | "https") => url,
        _ => return bad_request("image_url must be an http(s) URL"),
    };
    if !state.images.allows_source(&image_url) {
        tracing::warn!(host = ?image_url.host_str(), "refusing cover art download from unlisted host");
        return bad_request("image_url host is not an allowed image source");
    }
    let owner = match owner_segment(body.user_id.as_deref()) {
        Ok(owner) => owner,
        Err(response) => return response,
    };

    let image = match state.images.download(&image_url).await {
        Ok(image) => image,
        Err(error) => {
            tracing::error!(error = %error, "failed to download cover art");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to download generated image",
                Some(format!("{:#}", error)),
            );
        }
    };

    let path = cover_art_path(&owner, extension_for(&image.content_type));
    match state
        .supabase
        .upload_object(
            &state.config.cover_art_bucket,
            &path,
            &image.content_type,
            image.bytes,
        )
        .await
    {
        Ok(url) => (StatusCode::OK, Json(json!({ "url": url }))).into_response(),
        Err(error) => {
            tracing::error!(error = %error, "failed to upload cover art");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to store cover art",
                Some(format!("{:#}", error)),
            )
        }
    }
}

async fn load_local_view(
    state: &AppState,
    user_id: &str,
) -> anyhow::Result<LocalSubscriptionView> {
    let customer = store::find_customer_by_user(&state.supabase, user_id).await?;
    let subscription = match customer.as_ref() {
        Some(customer) => {
            store::latest_subscription_for_customer(&state.supabase, &customer.stripe_customer_id)
                .await?
        }
        None => None,
    };
    let tier = store::get_artist_profile(&state.supabase, user_id)
        .await?
        .and_then(|profile| profile.subscription_tier);

    Ok(LocalSubscriptionView {
        customer_id: customer.map(|customer| customer.stripe_customer_id),
        subscription,
        tier,
    })
}

async fn repair_remote(
    state: &AppState,
    user_id: &str,
    local: &LocalSubscriptionView,
) -> Result<Subscriber, RevenueCatError> {
    // Reading an unknown app user id creates it.
    state.revenuecat.get_subscriber(user_id).await?;

    if let (Some(customer_id), Some(subscription)) =
        (local.customer_id.as_deref(), local.subscription.as_ref())
    {
        mirror_purchase(
            state,
            user_id,
            &subscription.stripe_subscription_id,
            customer_id,
            None,
        )
        .await?;
    }

    state.revenuecat.get_subscriber(user_id).await
}

async fn mirror_purchase(
    state: &AppState,
    user_id: &str,
    fetch_token: &str,
    customer_id: &str,
    email: Option<&str>,
) -> Result<(), RevenueCatError> {
    state
        .revenuecat
        .post_stripe_purchase(user_id, fetch_token)
        .await?;

    let mut attributes = vec![("stripe_customer_id", customer_id)];
    if let Some(email) = email {
        attributes.push(("$email", email));
    }
    state.revenuecat.set_attributes(user_id, &attributes).await
}

fn degraded_entitlement(reason: &'static str, details: Option<String>) -> Response {
    (
        StatusCode::OK,
        Json(EntitlementCheckResponse {
            reason: Some(reason),
            details,
            ..Default::default()
        }),
    )
        .into_response()
}

fn owner_segment(user_id: Option<&str>) -> Result<String, Response> {
    match user_id {
        None => Ok("anonymous".to_string()),
        Some(raw) => clean_identifier(Some(raw))
            .map(ToString::to_string)
            .ok_or_else(|| bad_request("user_id is invalid")),
    }
}

fn cover_art_path(owner: &str, extension: &str) -> String {
    format!("{}/{}.{}", owner, Uuid::new_v4(), extension)
}

fn bad_request(message: &str) -> Response {
    error_response(StatusCode::BAD_REQUEST, message, None)
}

fn error_response(status: StatusCode, message: &str, details: Option<String>) -> Response {
    let body = match details {
        Some(details) => json!({ "error": message, "details": details }),
        None => json!({ "error": message }),
    };
    (status, Json(body)).into_response()
}
