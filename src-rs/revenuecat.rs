use std::collections::HashMap;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

#[derive(Clone)]
pub struct RevenueCatClient {
    http: reqwest::Client,
    api_key: Option<String>,
    product_id: Option<String>,
    base_url: String,
}

#[derive(Debug, Error)]
pub enum RevenueCatError {
    #[error("REVENUECAT_API_KEY is not configured.")]
    NotConfigured,
    #[error("RevenueCat subscriber not found")]
    NotFound,
    #[error("RevenueCat API {path} failed with status {status}: {body}")]
    Api {
        path: String,
        status: u16,
        body: String,
    },
    #[error("RevenueCat request failed for {path}: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to decode RevenueCat response for {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberResponse {
    pub subscriber: Subscriber,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub original_app_user_id: Option<String>,
    pub first_seen: Option<DateTime<Utc>>,
    pub management_url: Option<String>,
    #[serde(default)]
    pub entitlements: HashMap<String, Entitlement>,
    #[serde(default)]
    pub subscriptions: HashMap<String, SubscriptionInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entitlement {
    /// `None` for non-expiring grants.
    pub expires_date: Option<DateTime<Utc>>,
    pub purchase_date: Option<DateTime<Utc>>,
    pub product_identifier: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub expires_date: Option<DateTime<Utc>>,
    pub purchase_date: Option<DateTime<Utc>>,
    pub store: Option<String>,
    pub unsubscribe_detected_at: Option<DateTime<Utc>>,
}

impl Entitlement {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_date.map_or(true, |expires| expires > now)
    }
}

impl Subscriber {
    pub fn has_active_entitlement(&self, now: DateTime<Utc>) -> bool {
        self.entitlements
            .values()
            .any(|entitlement| entitlement.is_active_at(now))
    }

    /// Latest expiry among active entitlements; `None` when nothing is active
    /// or the active grants never expire.
    pub fn latest_active_expiry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.entitlements
            .values()
            .filter(|entitlement| entitlement.is_active_at(now))
            .filter_map(|entitlement| entitlement.expires_date)
            .max()
    }

    pub fn has_any_record(&self) -> bool {
        !self.entitlements.is_empty() || !self.subscriptions.is_empty()
    }
}

impl RevenueCatClient {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        product_id: Option<String>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to create RevenueCat HTTP client")?;

        Ok(Self {
            http,
            api_key,
            product_id,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// Fetches a subscriber. RevenueCat creates unknown app user ids on read,
    /// so this doubles as "create subscriber".
    pub async fn get_subscriber(&self, app_user_id: &str) -> Result<Subscriber, RevenueCatError> {
        let path = format!("subscribers/{}", app_user_id);
        let response: SubscriberResponse = self.send(self.http.get(self.url(&path)), &path).await?;
        Ok(response.subscriber)
    }

    /// Records a Stripe purchase for `app_user_id`; `fetch_token` is the Stripe
    /// subscription id (or checkout session id).
    pub async fn post_stripe_purchase(
        &self,
        app_user_id: &str,
        fetch_token: &str,
    ) -> Result<Subscriber, RevenueCatError> {
        let path = "receipts".to_string();
        let mut body = json!({
            "app_user_id": app_user_id,
            "fetch_token": fetch_token,
        });
        if let Some(product_id) = &self.product_id {
            body["product_id"] = json!(product_id);
        }

        let request = self
            .http
            .post(self.url(&path))
            .header("X-Platform", "stripe")
            .json(&body);
        let response: SubscriberResponse = self.send(request, &path).await?;
        Ok(response.subscriber)
    }

    pub async fn set_attributes(
        &self,
        app_user_id: &str,
        attributes: &[(&str, &str)],
    ) -> Result<(), RevenueCatError> {
        let path = format!("subscribers/{}/attributes", app_user_id);
        let attributes: serde_json::Map<String, serde_json::Value> = attributes
            .iter()
            .map(|(key, value)| (key.to_string(), json!({ "value": value })))
            .collect();

        let request = self
            .http
            .post(self.url(&path))
            .json(&json!({ "attributes": attributes }));
        let _: serde_json::Value = self.send(request, &path).await?;
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        path: &str,
    ) -> Result<T, RevenueCatError> {
        let key = self.api_key.as_deref().ok_or(RevenueCatError::NotConfigured)?;

        let response = request
            .bearer_auth(key)
            .send()
            .await
            .map_err(|source| RevenueCatError::Transport {
                path: path.to_string(),
                source,
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|source| RevenueCatError::Transport {
                path: path.to_string(),
                source,
            })?;

        if status == StatusCode::NOT_FOUND {
            return Err(RevenueCatError::NotFound);
        }
        if !status.is_success() {
            return Err(RevenueCatError::Api {
                path: path.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }

        // Attribute writes answer with an empty body.
        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(text).map_err(|source| RevenueCatError::Decode {
            path: path.to_string(),
            source,
        })
    }
}
