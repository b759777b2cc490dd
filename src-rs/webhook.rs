use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::{
    state::AppState,
    store::{self, CustomerRecord, SubscriptionWrite, SyncOutcome},
    stripe_api::{
        BillingEvent, Expandable, SignatureError, StripeCheckoutSession, StripeCustomer,
        StripeEvent, StripeInvoice, StripeSubscription,
    },
    tier::SubscriptionStatus,
};

/// Receives Stripe billing events. Anything that passes signature verification
/// is acknowledged with 200, even when applying it fails, so Stripe does not
/// redeliver; failures are logged instead.
pub async fn handle_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = match headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => value,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Missing Stripe signature." })),
            )
                .into_response()
        }
    };

    match state.stripe.verify_webhook_signature(signature, &body) {
        Ok(()) => {}
        Err(SignatureError::NotConfigured) => {
            tracing::error!("Stripe webhook received but STRIPE_WEBHOOK_SECRET is not set");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Webhook not configured." })),
            )
                .into_response();
        }
        Err(error) => {
            tracing::warn!(error = %error, "Stripe webhook signature verification failed");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("Webhook Error: {}", error) })),
            )
                .into_response();
        }
    }

    let event: StripeEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(error) => {
            tracing::error!(error = %error, "invalid Stripe webhook payload");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Invalid payload." })),
            )
                .into_response();
        }
    };

    let event_id = event.id.clone();
    let event_type = event.event_type.clone();
    let created = event.created;

    match event.into_billing_event() {
        Ok(billing_event) => {
            if let Err(error) = dispatch(&state, billing_event, created).await {
                tracing::error!(
                    error = %format!("{:#}", error),
                    event_id = %event_id,
                    event_type = %event_type,
                    "Stripe webhook handling failed"
                );
            }
        }
        Err(error) => {
            tracing::error!(
                error = %error,
                event_id = %event_id,
                event_type = %event_type,
                "failed to decode Stripe event object"
            );
        }
    }

    (StatusCode::OK, Json(json!({ "received": true }))).into_response()
}

async fn dispatch(
    state: &AppState,
    event: BillingEvent,
    created: Option<i64>,
) -> anyhow::Result<()> {
    match event {
        BillingEvent::CheckoutCompleted(session) => {
            on_checkout_completed(state, session, created).await
        }
        BillingEvent::SubscriptionChanged(subscription) => {
            on_subscription_changed(state, subscription, created).await
        }
        BillingEvent::SubscriptionDeleted(subscription) => {
            on_subscription_deleted(state, subscription, created).await
        }
        BillingEvent::InvoicePaid(invoice) => on_invoice_paid(state, invoice, created).await,
        BillingEvent::Unhandled(event_type) => {
            tracing::info!(event_type = %event_type, "ignoring unhandled Stripe event");
            Ok(())
        }
    }
}

async fn on_checkout_completed(
    state: &AppState,
    session: StripeCheckoutSession,
    created: Option<i64>,
) -> anyhow::Result<()> {
    let customer_ref = match session.customer.as_ref() {
        Some(customer) => customer,
        None => {
            tracing::warn!(session_id = %session.id, "checkout session completed without a customer");
            return Ok(());
        }
    };

    let hint = session.user_id().or_else(|| customer_hint(customer_ref));
    let customer = ensure_customer(state, customer_ref.id(), hint).await?;

    let subscription = match session.subscription.as_ref() {
        Some(Expandable::Object(subscription)) => (**subscription).clone(),
        Some(Expandable::Id(subscription_id)) => {
            state.stripe.retrieve_subscription(subscription_id).await?
        }
        None => return Ok(()),
    };

    let status = subscription.status.clone();
    apply(state, &customer, &subscription, status, created).await
}

async fn on_subscription_changed(
    state: &AppState,
    subscription: StripeSubscription,
    created: Option<i64>,
) -> anyhow::Result<()> {
    let customer = ensure_customer(
        state,
        subscription.customer.id(),
        customer_hint(&subscription.customer),
    )
    .await?;
    let status = subscription.status.clone();
    apply(state, &customer, &subscription, status, created).await
}

async fn on_subscription_deleted(
    state: &AppState,
    subscription: StripeSubscription,
    created: Option<i64>,
) -> anyhow::Result<()> {
    let customer = ensure_customer(
        state,
        subscription.customer.id(),
        customer_hint(&subscription.customer),
    )
    .await?;
    apply(
        state,
        &customer,
        &subscription,
        SubscriptionStatus::Canceled,
        created,
    )
    .await
}

async fn on_invoice_paid(
    state: &AppState,
    invoice: StripeInvoice,
    created: Option<i64>,
) -> anyhow::Result<()> {
    let (customer_ref, subscription_id) =
        match (invoice.customer.as_ref(), invoice.subscription_id()) {
            (Some(customer), Some(subscription_id)) => (customer, subscription_id.to_string()),
            _ => {
                tracing::info!(invoice_id = ?invoice.id, "paid invoice is not tied to a subscription");
                return Ok(());
            }
        };

    let customer = ensure_customer(state, customer_ref.id(), customer_hint(customer_ref)).await?;
    let (period_start, period_end) = invoice.period();

    let write = SubscriptionWrite {
        customer_id: customer.stripe_customer_id.clone(),
        subscription_id,
        status: SubscriptionStatus::Active,
        period_start,
        period_end,
        cancel_at_period_end: None,
        event_created: created,
    };
    record_outcome(store::sync_subscription(&state.supabase, &customer, &write).await?, &write);
    Ok(())
}

async fn apply(
    state: &AppState,
    customer: &CustomerRecord,
    subscription: &StripeSubscription,
    status: SubscriptionStatus,
    created: Option<i64>,
) -> anyhow::Result<()> {
    let (period_start, period_end) = subscription.period();
    let write = SubscriptionWrite {
        customer_id: customer.stripe_customer_id.clone(),
        subscription_id: subscription.id.clone(),
        status,
        period_start,
        period_end,
        cancel_at_period_end: Some(subscription.cancel_at_period_end),
        event_created: created,
    };
    record_outcome(store::sync_subscription(&state.supabase, customer, &write).await?, &write);
    Ok(())
}

fn record_outcome(outcome: SyncOutcome, write: &SubscriptionWrite) {
    match outcome {
        SyncOutcome::Applied { tier, user_id } => tracing::info!(
            customer_id = %write.customer_id,
            subscription_id = %write.subscription_id,
            status = %write.status,
            tier = tier.as_str(),
            user_id = ?user_id,
            "subscription state applied"
        ),
        SyncOutcome::Stale { stored_event_at } => tracing::warn!(
            customer_id = %write.customer_id,
            subscription_id = %write.subscription_id,
            event_created = ?write.event_created,
            stored_event_at,
            "ignoring out-of-order Stripe event"
        ),
    }
}

/// Loads the local customer row, creating or relinking it as needed. The user id
/// comes from `hint`, else the existing row, else the Stripe customer's metadata.
async fn ensure_customer(
    state: &AppState,
    customer_id: &str,
    hint: Option<&str>,
) -> anyhow::Result<CustomerRecord> {
    let existing = store::get_customer(&state.supabase, customer_id).await?;

    if let Some(record) = existing.as_ref() {
        let linked = record.user_id.as_deref();
        if linked.is_some() && (hint.is_none() || hint == linked) {
            return Ok(record.clone());
        }
    }

    let user_id = match hint {
        Some(user_id) => Some(user_id.to_string()),
        None => user_from_stripe(state, customer_id).await,
    };

    if user_id.is_none() {
        tracing::warn!(customer_id = %customer_id, "no user id known for Stripe customer");
    }
    store::upsert_customer(&state.supabase, customer_id, user_id.as_deref()).await
}

async fn user_from_stripe(state: &AppState, customer_id: &str) -> Option<String> {
    if !state.stripe.is_configured() {
        return None;
    }

    match state.stripe.retrieve_customer(customer_id).await {
        Ok(customer) if !customer.deleted => customer.user_id().map(ToString::to_string),
        Ok(_) => None,
        Err(error) => {
            tracing::warn!(error = %error, customer_id = %customer_id, "failed to look up Stripe customer");
            None
        }
    }
}

fn customer_hint(customer: &Expandable<StripeCustomer>) -> Option<&str> {
    customer.as_object().and_then(StripeCustomer::user_id)
}
