mod config;
mod elevenlabs;
mod handlers;
mod ids;
mod images;
mod middleware;
mod rate_limit;
mod revenuecat;
mod state;
mod store;
mod stripe_api;
mod supabase;
mod tier;
mod webhook;

#[cfg(test)]
mod test_support;

use std::{collections::HashSet, env, net::SocketAddr, path::PathBuf};

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    http::Method,
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use config::Config;
use state::AppState;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let loaded_env_files = load_env_files()?;
    init_tracing();
    if loaded_env_files.is_empty() {
        tracing::warn!("No .env or .env.local file found. Using process environment only.");
    } else {
        let files = loaded_env_files
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(files = %files, "Loaded environment files");
    }

    let config = Config::from_env()?;

    if config.stripe_secret_key.is_none() {
        if env::var("NODE_ENV")
            .ok()
            .map(|value| value.eq_ignore_ascii_case("production"))
            .unwrap_or(false)
        {
            return Err(anyhow::anyhow!(
                "STRIPE_SECRET_KEY environment variable is not set"
            ));
        }

        tracing::warn!(
            "STRIPE_SECRET_KEY is not set. Stripe functionality will not work until it is provided."
        );
    }
    if config.stripe_webhook_secret.is_none() {
        tracing::warn!("STRIPE_WEBHOOK_SECRET is not set. Webhook deliveries will be rejected.");
    }
    if config.supabase_service_role_key.is_none() {
        tracing::warn!("SUPABASE_SERVICE_ROLE_KEY is not set. Datastore writes will fail.");
    }
    if config.revenuecat_api_key.is_none() {
        tracing::warn!("REVENUECAT_API_KEY is not set. Entitlement checks will report no access.");
    }
    if config.elevenlabs_api_key.is_none() {
        tracing::warn!("ELEVENLABS_API_KEY is not set. Voice endpoints are disabled.");
    }
    if config.openai_api_key.is_none() {
        tracing::warn!("OPENAI_API_KEY is not set. Cover art generation is disabled.");
    }

    let state = AppState::from_config(config.clone())?;

    match state.supabase.ping().await {
        Ok(()) => {
            tracing::info!(supabase_url = %config.supabase_url, "Supabase connectivity check passed");
        }
        Err(error) => {
            tracing::error!(
                error = ?error,
                supabase_url = %config.supabase_url,
                "Supabase connectivity check failed. Check SUPABASE_URL and that the project is reachable."
            );
        }
    }

    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    if let Some((cert_path, key_path)) = valid_tls_paths(&config) {
        let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .context("failed to load TLS certificate/key")?;

        tracing::info!(
            port = config.port,
            "TLS configuration loaded. Running in HTTPS mode."
        );

        axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context("HTTPS server failed")?;
    } else {
        tracing::info!(port = config.port, "Running in HTTP mode.");
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("failed to bind TCP listener")?;

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .context("HTTP server failed")?;
    }

    Ok(())
}

fn build_router(state: AppState) -> Router {
    let ai_router = Router::new()
        .route("/voice/generate", post(handlers::generate_voice))
        .route("/voice/voices", get(handlers::list_voices))
        .route("/cover-art/generate", post(handlers::generate_cover_art))
        .route("/cover-art/persist", post(handlers::persist_cover_art))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::ai_rate_limit,
        ));

    let api_router = Router::new()
        .route("/stripe/webhook", post(webhook::handle_stripe_webhook))
        .route("/stripe/link-checkout", post(handlers::link_checkout))
        .route("/entitlements/check", post(handlers::check_entitlement))
        .route("/debug/subscription", post(handlers::debug_subscription))
        .merge(ai_router);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api_router)
        .fallback(handlers::not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn valid_tls_paths(config: &Config) -> Option<(String, String)> {
    let cert_path = config
        .tls_cert_path
        .as_ref()
        .map(|path| path.to_string_lossy().to_string());
    let key_path = config
        .tls_key_path
        .as_ref()
        .map(|path| path.to_string_lossy().to_string());

    match (cert_path, key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert_exists = std::path::Path::new(&cert_path).exists();
            let key_exists = std::path::Path::new(&key_path).exists();

            if cert_exists && key_exists {
                Some((cert_path, key_path))
            } else {
                if !key_exists {
                    tracing::error!(path = %key_path, "TLS key file not found");
                }
                if !cert_exists {
                    tracing::error!(path = %cert_path, "TLS certificate file not found");
                }
                tracing::error!("Proceeding without TLS.");
                None
            }
        }
        (Some(cert_path), None) => {
            tracing::error!(path = %cert_path, "TLS certificate file provided but TLS key path missing");
            tracing::error!("Proceeding without TLS.");
            None
        }
        (None, Some(key_path)) => {
            tracing::error!(path = %key_path, "TLS key file provided but TLS certificate path missing");
            tracing::error!("Proceeding without TLS.");
            None
        }
        (None, None) => None,
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn load_env_files() -> anyhow::Result<Vec<PathBuf>> {
    let mut roots = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        roots.push(cwd);
    }
    if let Ok(executable_path) = env::current_exe() {
        if let Some(executable_dir) = executable_path.parent() {
            roots.push(executable_dir.to_path_buf());
        }
    }
    roots.push(PathBuf::from(env!("CARGO_MANIFEST_DIR")));

    let mut seen_roots = HashSet::new();
    let mut loaded = Vec::new();

    for root in roots {
        let key = root.to_string_lossy().to_string();
        if !seen_roots.insert(key) {
            continue;
        }

        for filename in [".env", ".env.local"] {
            let path = root.join(filename);
            if path.is_file() {
                dotenvy::from_path(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?;
                loaded.push(path);
            }
        }
    }

    if loaded.is_empty() {
        if let Ok(path) = dotenvy::dotenv() {
            loaded.push(path);
        }
    }

    Ok(loaded)
}
