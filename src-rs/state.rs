use std::{sync::Arc, time::Duration};

use crate::{
    config::Config, elevenlabs::ElevenLabsClient, images::ImageClient,
    rate_limit::InMemoryRateLimiter, revenuecat::RevenueCatClient, stripe_api::StripeApi,
    supabase::SupabaseClient,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub supabase: SupabaseClient,
    pub stripe: StripeApi,
    pub revenuecat: RevenueCatClient,
    pub elevenlabs: ElevenLabsClient,
    pub images: ImageClient,
    pub ai_limiter: Arc<InMemoryRateLimiter>,
}

impl AppState {
    /// Builds every outbound client from configuration.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let supabase = SupabaseClient::new(
            config.supabase_url.clone(),
            config.supabase_service_role_key.as_deref(),
        )?;
        let stripe = StripeApi::new(
            config.stripe_api_base.clone(),
            config.stripe_secret_key.clone(),
            config.stripe_webhook_secret.clone(),
            config.stripe_webhook_tolerance_secs,
        )?;
        let revenuecat = RevenueCatClient::new(
            config.revenuecat_api_base.clone(),
            config.revenuecat_api_key.clone(),
            config.revenuecat_product_id.clone(),
        )?;
        let elevenlabs = ElevenLabsClient::new(
            config.elevenlabs_api_base.clone(),
            config.elevenlabs_api_key.clone(),
            config.elevenlabs_model_id.clone(),
        )?;
        let images = ImageClient::new(
            config.image_api_base.clone(),
            config.openai_api_key.clone(),
            config.image_model.clone(),
            config.image_download_hosts.clone(),
        )?;

        Ok(Self {
            ai_limiter: Arc::new(InMemoryRateLimiter::new(
                Duration::from_secs(15 * 60),
                config.ai_rate_limit_max,
            )),
            config: Arc::new(config),
            supabase,
            stripe,
            revenuecat,
            elevenlabs,
            images,
        })
    }
}
