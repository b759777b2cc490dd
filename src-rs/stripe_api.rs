use std::collections::HashMap;

use anyhow::{anyhow, Context};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::tier::SubscriptionStatus;

#[derive(Clone)]
pub struct StripeApi {
    http: reqwest::Client,
    secret_key: Option<String>,
    webhook_secret: Option<String>,
    base_url: String,
    tolerance_secs: i64,
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("STRIPE_WEBHOOK_SECRET is not configured.")]
    NotConfigured,
    #[error("Missing Stripe timestamp in signature.")]
    MissingTimestamp,
    #[error("Missing Stripe v1 signature.")]
    MissingSignature,
    #[error("Stripe signature timestamp outside tolerance.")]
    OutsideTolerance,
    #[error("invalid UTF-8 payload for Stripe signature")]
    InvalidPayload,
    #[error("Invalid Stripe signature.")]
    Mismatch,
}

impl StripeApi {
    pub fn new(
        base_url: String,
        secret_key: Option<String>,
        webhook_secret: Option<String>,
        tolerance_secs: i64,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to create Stripe HTTP client")?;

        Ok(Self {
            http,
            secret_key,
            webhook_secret,
            base_url: base_url.trim_end_matches('/').to_string(),
            tolerance_secs,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.require_secret_key().is_ok()
    }

    pub fn verify_webhook_signature(
        &self,
        signature_header: &str,
        payload: &[u8],
    ) -> Result<(), SignatureError> {
        let webhook_secret = self
            .webhook_secret
            .as_deref()
            .ok_or(SignatureError::NotConfigured)?;

        verify_signature(
            webhook_secret,
            signature_header,
            payload,
            Utc::now().timestamp(),
            self.tolerance_secs,
        )
    }

    pub async fn retrieve_customer(&self, customer_id: &str) -> anyhow::Result<StripeCustomer> {
        self.get_json(&format!("customers/{}", customer_id), &[])
            .await
    }

    /// Fetches a checkout session with its customer and subscription expanded.
    pub async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> anyhow::Result<StripeCheckoutSession> {
        self.get_json(
            &format!("checkout/sessions/{}", session_id),
            &[("expand[]", "customer"), ("expand[]", "subscription")],
        )
        .await
    }

    pub async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> anyhow::Result<StripeSubscription> {
        self.get_json(&format!("subscriptions/{}", subscription_id), &[])
            .await
    }

    fn require_secret_key(&self) -> anyhow::Result<&str> {
        self.secret_key
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow!("STRIPE_SECRET_KEY is not configured."))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> anyhow::Result<T> {
        let key = self.require_secret_key()?;
        let url = format!("{}/{}", self.base_url, path);

        let response = self
            .http
            .get(url)
            .bearer_auth(key)
            .query(query)
            .send()
            .await
            .with_context(|| format!("Stripe GET failed for {}", path))?;

        parse_stripe_response(response, path).await
    }
}

pub fn verify_signature(
    webhook_secret: &str,
    signature_header: &str,
    payload: &[u8],
    now: i64,
    tolerance_secs: i64,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signatures: Vec<&str> = Vec::new();

    for part in signature_header.split(',') {
        let mut pieces = part.trim().splitn(2, '=');
        let key = pieces.next().unwrap_or_default();
        let value = pieces.next().unwrap_or_default();
        if key == "t" {
            timestamp = value.parse::<i64>().ok();
        } else if key == "v1" {
            v1_signatures.push(value);
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::MissingTimestamp)?;
    if v1_signatures.is_empty() {
        return Err(SignatureError::MissingSignature);
    }

    let within_tolerance = now
        .checked_sub(timestamp)
        .map(i64::unsigned_abs)
        .is_some_and(|skew| skew <= tolerance_secs.unsigned_abs());
    if !within_tolerance {
        return Err(SignatureError::OutsideTolerance);
    }

    let payload_str = std::str::from_utf8(payload).map_err(|_| SignatureError::InvalidPayload)?;
    let signed_payload = format!("{}.{}", timestamp, payload_str);

    // HMAC accepts keys of any length, so this cannot fail in practice.
    let mut mac = Hmac::<Sha256>::new_from_slice(webhook_secret.as_bytes())
        .map_err(|_| SignatureError::NotConfigured)?;
    mac.update(signed_payload.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    let is_match = v1_signatures
        .into_iter()
        .any(|candidate| expected.as_bytes().ct_eq(candidate.as_bytes()).into());

    if !is_match {
        return Err(SignatureError::Mismatch);
    }

    Ok(())
}

async fn parse_stripe_response<T: DeserializeOwned>(
    response: reqwest::Response,
    path: &str,
) -> anyhow::Result<T> {
    let status = response.status();
    let text = response
        .text()
        .await
        .with_context(|| format!("failed to read Stripe response body for {}", path))?;

    if !status.is_success() {
        return Err(anyhow!(
            "Stripe API {} failed with status {}: {}",
            path,
            status,
            text
        ));
    }

    serde_json::from_str::<T>(&text)
        .with_context(|| format!("failed to decode Stripe response for {}", path))
}

/// A field Stripe returns either as a bare id or, when expanded, as the full object.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Expandable<T> {
    Id(String),
    Object(Box<T>),
}

pub trait HasId {
    fn id(&self) -> &str;
}

impl<T: HasId> Expandable<T> {
    pub fn id(&self) -> &str {
        match self {
            Expandable::Id(value) => value,
            Expandable::Object(object) => object.id(),
        }
    }

    pub fn as_object(&self) -> Option<&T> {
        match self {
            Expandable::Id(_) => None,
            Expandable::Object(object) => Some(object),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StripeCustomer {
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
    pub email: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl StripeCustomer {
    /// The platform user id recorded on the customer at checkout, if any.
    pub fn user_id(&self) -> Option<&str> {
        ["user_id", "supabase_user_id", "userId"]
            .iter()
            .filter_map(|key| self.metadata.get(*key))
            .map(String::as_str)
            .find(|value| !value.trim().is_empty())
    }
}

impl HasId for StripeCustomer {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCheckoutSession {
    pub id: String,
    pub status: Option<String>,
    pub client_reference_id: Option<String>,
    pub customer: Option<Expandable<StripeCustomer>>,
    pub customer_email: Option<String>,
    pub customer_details: Option<StripeCustomerDetails>,
    pub subscription: Option<Expandable<StripeSubscription>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl StripeCheckoutSession {
    pub fn user_id(&self) -> Option<&str> {
        self.client_reference_id
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| {
                self.metadata
                    .get("user_id")
                    .map(String::as_str)
                    .filter(|value| !value.trim().is_empty())
            })
    }

    pub fn email(&self) -> Option<&str> {
        self.customer_details
            .as_ref()
            .and_then(|details| details.email.as_deref())
            .or(self.customer_email.as_deref())
            .or_else(|| {
                self.customer
                    .as_ref()
                    .and_then(Expandable::as_object)
                    .and_then(|customer| customer.email.as_deref())
            })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCustomerDetails {
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StripeSubscription {
    pub id: String,
    pub customer: Expandable<StripeCustomer>,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub items: StripeSubscriptionItems,
}

impl StripeSubscription {
    /// Billing period, falling back to the first item for API versions that
    /// moved the period off the subscription.
    pub fn period(&self) -> (Option<i64>, Option<i64>) {
        let item = self.items.data.first();
        (
            self.current_period_start
                .or_else(|| item.and_then(|item| item.current_period_start)),
            self.current_period_end
                .or_else(|| item.and_then(|item| item.current_period_end)),
        )
    }
}

impl HasId for StripeSubscription {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StripeSubscriptionItems {
    #[serde(default)]
    pub data: Vec<StripeSubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StripeSubscriptionItem {
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeInvoice {
    pub id: Option<String>,
    pub customer: Option<Expandable<StripeCustomer>>,
    pub subscription: Option<Expandable<StripeSubscription>>,
    pub parent: Option<StripeInvoiceParent>,
    pub lines: Option<StripeInvoiceLines>,
}

impl StripeInvoice {
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_ref().map(Expandable::id).or_else(|| {
            self.parent
                .as_ref()
                .and_then(|parent| parent.subscription_details.as_ref())
                .and_then(|details| details.subscription.as_deref())
        })
    }

    pub fn period(&self) -> (Option<i64>, Option<i64>) {
        self.lines
            .as_ref()
            .and_then(|lines| lines.data.first())
            .and_then(|line| line.period.as_ref())
            .map(|period| (period.start, period.end))
            .unwrap_or((None, None))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeInvoiceParent {
    pub subscription_details: Option<StripeInvoiceSubscriptionDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeInvoiceSubscriptionDetails {
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeInvoiceLines {
    #[serde(default)]
    pub data: Vec<StripeInvoiceLine>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeInvoiceLine {
    pub period: Option<StripePeriod>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripePeriod {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix seconds; events without it carry no ordering watermark.
    pub created: Option<i64>,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

/// The billing lifecycle events this service reacts to.
#[derive(Debug, Clone)]
pub enum BillingEvent {
    CheckoutCompleted(StripeCheckoutSession),
    SubscriptionChanged(StripeSubscription),
    SubscriptionDeleted(StripeSubscription),
    InvoicePaid(StripeInvoice),
    Unhandled(String),
}

impl StripeEvent {
    pub fn into_billing_event(self) -> Result<BillingEvent, serde_json::Error> {
        let object = self.data.object;
        Ok(match self.event_type.as_str() {
            "checkout.session.completed" => {
                BillingEvent::CheckoutCompleted(serde_json::from_value(object)?)
            }
            "customer.subscription.created" | "customer.subscription.updated" => {
                BillingEvent::SubscriptionChanged(serde_json::from_value(object)?)
            }
            "customer.subscription.deleted" => {
                BillingEvent::SubscriptionDeleted(serde_json::from_value(object)?)
            }
            "invoice.payment_succeeded" => BillingEvent::InvoicePaid(serde_json::from_value(object)?),
            _ => BillingEvent::Unhandled(self.event_type),
        })
    }
}
