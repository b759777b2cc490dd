use std::{env, path::PathBuf};

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub trust_proxy: bool,
    pub tls_key_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub supabase_url: String,
    pub supabase_service_role_key: Option<String>,
    pub cover_art_bucket: String,
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub stripe_api_base: String,
    pub stripe_webhook_tolerance_secs: i64,
    pub revenuecat_api_key: Option<String>,
    pub revenuecat_product_id: Option<String>,
    pub revenuecat_api_base: String,
    pub elevenlabs_api_key: Option<String>,
    pub elevenlabs_api_base: String,
    pub elevenlabs_default_voice_id: String,
    pub elevenlabs_model_id: String,
    pub openai_api_key: Option<String>,
    pub image_api_base: String,
    pub image_model: String,
    pub image_download_hosts: Vec<String>,
    pub ai_rate_limit_max: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = parse_u16(env::var("PORT").ok(), 9001);

        let trust_proxy = match env::var("TRUST_PROXY") {
            Ok(value) => {
                let normalized = value.trim().to_lowercase();
                !matches!(normalized.as_str(), "false" | "0" | "off" | "no")
            }
            Err(_) => true,
        };

        let supabase_url = env::var("SUPABASE_URL")
            .map_err(|_| anyhow::anyhow!("SUPABASE_URL environment variable is not set"))?;
        let supabase_url = supabase_url.trim().trim_end_matches('/').to_string();

        Ok(Self {
            port,
            trust_proxy,
            tls_key_path: env::var("TLS_KEY_PATH").ok().map(PathBuf::from),
            tls_cert_path: env::var("TLS_CERT_PATH").ok().map(PathBuf::from),
            supabase_url,
            supabase_service_role_key: non_empty(env::var("SUPABASE_SERVICE_ROLE_KEY").ok()),
            cover_art_bucket: env::var("COVER_ART_BUCKET")
                .unwrap_or_else(|_| "cover-art".to_string()),
            stripe_secret_key: non_empty(env::var("STRIPE_SECRET_KEY").ok()),
            stripe_webhook_secret: non_empty(env::var("STRIPE_WEBHOOK_SECRET").ok()),
            stripe_api_base: env::var("STRIPE_API_BASE")
                .unwrap_or_else(|_| "https://api.stripe.com/v1".to_string()),
            stripe_webhook_tolerance_secs: i64::from(parse_u16(
                env::var("STRIPE_WEBHOOK_TOLERANCE_SECS").ok(),
                300,
            )),
            revenuecat_api_key: non_empty(env::var("REVENUECAT_API_KEY").ok()),
            revenuecat_product_id: non_empty(env::var("REVENUECAT_PRODUCT_ID").ok()),
            revenuecat_api_base: env::var("REVENUECAT_API_BASE")
                .unwrap_or_else(|_| "https://api.revenuecat.com/v1".to_string()),
            elevenlabs_api_key: non_empty(env::var("ELEVENLABS_API_KEY").ok()),
            elevenlabs_api_base: env::var("ELEVENLABS_API_BASE")
                .unwrap_or_else(|_| "https://api.elevenlabs.io/v1".to_string()),
            elevenlabs_default_voice_id: env::var("ELEVENLABS_DEFAULT_VOICE_ID")
                .unwrap_or_else(|_| "21m00Tcm4TlvDq8ikWAM".to_string()),
            elevenlabs_model_id: env::var("ELEVENLABS_MODEL_ID")
                .unwrap_or_else(|_| "eleven_multilingual_v2".to_string()),
            openai_api_key: non_empty(env::var("OPENAI_API_KEY").ok()),
            image_api_base: env::var("IMAGE_API_BASE")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            image_model: env::var("IMAGE_MODEL").unwrap_or_else(|_| "dall-e-3".to_string()),
            image_download_hosts: parse_list(
                env::var("IMAGE_DOWNLOAD_HOSTS").ok(),
                &["oaidalleapiprodscus.blob.core.windows.net"],
            ),
            ai_rate_limit_max: parse_usize(env::var("AI_RATE_LIMIT_MAX").ok(), 30),
        })
    }
}

fn parse_u16(value: Option<String>, fallback: u16) -> u16 {
    value
        .and_then(|v| v.trim().parse::<u16>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

fn parse_list(value: Option<String>, fallback: &[&str]) -> Vec<String> {
    let parsed: Vec<String> = value
        .unwrap_or_default()
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect();

    if parsed.is_empty() {
        fallback.iter().map(|item| item.to_string()).collect()
    } else {
        parsed
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
