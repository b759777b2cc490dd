use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    supabase::SupabaseClient,
    tier::{ArtistTier, SubscriptionStatus},
};

const CUSTOMERS: &str = "customers";
const SUBSCRIPTIONS: &str = "subscriptions";
const ARTIST_PROFILES: &str = "artist_profiles";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub stripe_customer_id: String,
    pub user_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub stripe_customer_id: String,
    pub stripe_subscription_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    pub last_event_at: Option<i64>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtistProfileRecord {
    pub user_id: String,
    pub subscription_tier: Option<ArtistTier>,
}

#[derive(Debug, Serialize)]
struct CustomerRow<'a> {
    stripe_customer_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<&'a str>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct SubscriptionRow<'a> {
    stripe_customer_id: &'a str,
    stripe_subscription_id: &'a str,
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_period_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_period_end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cancel_at_period_end: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_event_at: Option<i64>,
    updated_at: DateTime<Utc>,
}

/// A subscription state change to persist, in Stripe's units (unix seconds).
#[derive(Debug, Clone)]
pub struct SubscriptionWrite {
    pub customer_id: String,
    pub subscription_id: String,
    pub status: SubscriptionStatus,
    pub period_start: Option<i64>,
    pub period_end: Option<i64>,
    /// `None` keeps whatever the row already holds.
    pub cancel_at_period_end: Option<bool>,
    /// `created` of the Stripe event that produced this write, if any.
    pub event_created: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied {
        tier: ArtistTier,
        user_id: Option<String>,
    },
    /// An event newer than this one was already applied to the row.
    Stale { stored_event_at: i64 },
}

pub async fn get_customer(
    supabase: &SupabaseClient,
    customer_id: &str,
) -> anyhow::Result<Option<CustomerRecord>> {
    let rows: Vec<CustomerRecord> = supabase
        .select(
            CUSTOMERS,
            &[("stripe_customer_id", customer_id)],
            None,
            Some(1),
        )
        .await
        .with_context(|| format!("failed to load customer {}", customer_id))?;
    Ok(rows.into_iter().next())
}

pub async fn find_customer_by_user(
    supabase: &SupabaseClient,
    user_id: &str,
) -> anyhow::Result<Option<CustomerRecord>> {
    let rows: Vec<CustomerRecord> = supabase
        .select(
            CUSTOMERS,
            &[("user_id", user_id)],
            Some("updated_at.desc"),
            Some(1),
        )
        .await
        .with_context(|| format!("failed to load customer for user {}", user_id))?;
    Ok(rows.into_iter().next())
}

/// Inserts or refreshes a customer row. A `None` user id leaves an existing link untouched.
pub async fn upsert_customer(
    supabase: &SupabaseClient,
    customer_id: &str,
    user_id: Option<&str>,
) -> anyhow::Result<CustomerRecord> {
    let row = CustomerRow {
        stripe_customer_id: customer_id,
        user_id,
        updated_at: Utc::now(),
    };
    let rows: Vec<CustomerRecord> = supabase
        .upsert(CUSTOMERS, "stripe_customer_id", &[row])
        .await
        .with_context(|| format!("failed to upsert customer {}", customer_id))?;

    rows.into_iter()
        .next()
        .ok_or_else(|| anyhow!("customer upsert for {} returned no row", customer_id))
}

pub async fn get_subscription(
    supabase: &SupabaseClient,
    customer_id: &str,
    subscription_id: &str,
) -> anyhow::Result<Option<SubscriptionRecord>> {
    let rows: Vec<SubscriptionRecord> = supabase
        .select(
            SUBSCRIPTIONS,
            &[
                ("stripe_customer_id", customer_id),
                ("stripe_subscription_id", subscription_id),
            ],
            None,
            Some(1),
        )
        .await
        .with_context(|| format!("failed to load subscription {}", subscription_id))?;
    Ok(rows.into_iter().next())
}

pub async fn latest_subscription_for_customer(
    supabase: &SupabaseClient,
    customer_id: &str,
) -> anyhow::Result<Option<SubscriptionRecord>> {
    let rows: Vec<SubscriptionRecord> = supabase
        .select(
            SUBSCRIPTIONS,
            &[("stripe_customer_id", customer_id)],
            Some("updated_at.desc"),
            Some(1),
        )
        .await
        .with_context(|| format!("failed to load subscriptions for customer {}", customer_id))?;
    Ok(rows.into_iter().next())
}

pub async fn upsert_subscription(
    supabase: &SupabaseClient,
    write: &SubscriptionWrite,
) -> anyhow::Result<SubscriptionRecord> {
    let row = SubscriptionRow {
        stripe_customer_id: &write.customer_id,
        stripe_subscription_id: &write.subscription_id,
        status: write.status.as_str(),
        current_period_start: write.period_start.and_then(from_unix),
        current_period_end: write.period_end.and_then(from_unix),
        cancel_at_period_end: write.cancel_at_period_end,
        last_event_at: write.event_created,
        updated_at: Utc::now(),
    };
    let rows: Vec<SubscriptionRecord> = supabase
        .upsert(
            SUBSCRIPTIONS,
            "stripe_customer_id,stripe_subscription_id",
            &[row],
        )
        .await
        .with_context(|| format!("failed to upsert subscription {}", write.subscription_id))?;

    rows.into_iter().next().ok_or_else(|| {
        anyhow!(
            "subscription upsert for {} returned no row",
            write.subscription_id
        )
    })
}

/// Sets the tier on an existing artist profile. Returns `false` when the user
/// has no profile; profiles are never created here.
pub async fn set_artist_tier(
    supabase: &SupabaseClient,
    user_id: &str,
    tier: ArtistTier,
) -> anyhow::Result<bool> {
    let rows: Vec<ArtistProfileRecord> = supabase
        .update(
            ARTIST_PROFILES,
            &[("user_id", user_id)],
            &serde_json::json!({ "subscription_tier": tier.as_str() }),
        )
        .await
        .with_context(|| format!("failed to set tier for user {}", user_id))?;
    Ok(!rows.is_empty())
}

pub async fn get_artist_profile(
    supabase: &SupabaseClient,
    user_id: &str,
) -> anyhow::Result<Option<ArtistProfileRecord>> {
    let rows: Vec<ArtistProfileRecord> = supabase
        .select(ARTIST_PROFILES, &[("user_id", user_id)], None, Some(1))
        .await
        .with_context(|| format!("failed to load artist profile for {}", user_id))?;
    Ok(rows.into_iter().next())
}

/// Persists a subscription state change and derives the owner's tier from it.
///
/// Writes that carry an event timestamp are dropped when the stored row was
/// last written by a strictly newer event.
pub async fn sync_subscription(
    supabase: &SupabaseClient,
    customer: &CustomerRecord,
    write: &SubscriptionWrite,
) -> anyhow::Result<SyncOutcome> {
    if let Some(created) = write.event_created {
        let existing =
            get_subscription(supabase, &write.customer_id, &write.subscription_id).await?;
        if let Some(stored_event_at) = existing.and_then(|row| row.last_event_at) {
            if created < stored_event_at {
                return Ok(SyncOutcome::Stale { stored_event_at });
            }
        }
    }

    let record = upsert_subscription(supabase, write).await?;
    let tier = ArtistTier::for_status(&record.status);

    let user_id = customer.user_id.clone();
    match user_id.as_deref() {
        Some(user_id) => {
            if !set_artist_tier(supabase, user_id, tier).await? {
                tracing::warn!(user_id = %user_id, "no artist profile to update tier on");
            }
        }
        None => {
            tracing::warn!(
                customer_id = %customer.stripe_customer_id,
                "customer has no linked user; tier not updated"
            );
        }
    }

    Ok(SyncOutcome::Applied { tier, user_id })
}

fn from_unix(seconds: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0)
}
