mod auth;
mod config;
mod constants;
mod crypto;
mod error;
mod openai;
mod providers;
mod proxy;
mod routes;
mod store;
mod transforms;

use axum::{
    Router, ServiceExt,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get, post},
};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::normalize_path::NormalizePath;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use auth::{CredentialResolver, KeyResolver, OAuthManager, RateLimiter};
use config::{Config, CorsMode};
use crypto::Crypto;
use providers::ProviderRegistry;
use proxy::ModelCache;
use store::StoreClient;

pub struct AppState {
    pub store: Arc<StoreClient>,
    pub crypto: Arc<Crypto>,
    pub oauth: Arc<OAuthManager>,
    pub credentials: CredentialResolver,
    pub keys: KeyResolver,
    pub rate_limiter: Arc<RateLimiter>,
    pub providers: ProviderRegistry,
    pub model_cache: ModelCache,
    /// Long-timeout client for completion traffic.
    pub http: reqwest::Client,
    /// Short-timeout client for token, models, and session calls.
    pub control: reqwest::Client,
    pub site_url: String,
    pub cors_mode: CorsMode,
}

#[derive(Parser)]
#[command(name = "modelgate")]
#[command(about = "Multi-provider LLM gateway")]
struct Args {
    /// Host to bind to
    #[arg(short = 'H', long, env = "MODELGATE_HOST")]
    host: Option<String>,

    /// Port to bind to
    #[arg(short, long, env = "MODELGATE_PORT")]
    port: Option<u16>,
}

fn apply_v1_cors(mode: &CorsMode, origin: Option<&str>, headers: &mut HeaderMap) {
    if let Some(allow) = mode.allow_origin_value(origin)
        && let Ok(value) = HeaderValue::from_str(&allow)
    {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization, x-api-key"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );
}

/// CORS for the caller-facing `/v1` surface. Preflight answers 204 empty.
async fn v1_cors_middleware(
    State(state): State<Arc<AppState>>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_v1_cors(&state.cors_mode, origin.as_deref(), response.headers_mut());
        return response;
    }

    let mut response = next.run(request).await;
    apply_v1_cors(&state.cors_mode, origin.as_deref(), response.headers_mut());
    response
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env();

    let host = args.host.unwrap_or(config.host);
    let port = args.port.unwrap_or(config.port);

    // Shared HTTP clients with connection pooling; completions get a long
    // deadline, control-plane calls a short one
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(300))
        .pool_max_idle_per_host(10)
        .build()
        .expect("Failed to create HTTP client");
    let control = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .expect("Failed to create HTTP client");

    let store = Arc::new(StoreClient::new(
        config.store_url.clone(),
        config.store_admin_key.clone(),
        control.clone(),
    ));
    let crypto = Arc::new(Crypto::new(&config.encryption_key));
    let oauth = Arc::new(OAuthManager::new(
        Arc::clone(&store),
        Arc::clone(&crypto),
        control.clone(),
    ));
    let credentials =
        CredentialResolver::new(Arc::clone(&store), Arc::clone(&crypto), Arc::clone(&oauth));
    let keys = KeyResolver::new(Arc::clone(&store));
    let rate_limiter = Arc::new(RateLimiter::new());
    let providers = ProviderRegistry::new(http.clone());

    auth::rate_limit::spawn_gc(Arc::clone(&rate_limiter));
    auth::oauth::spawn_background_refresh(Arc::clone(&oauth));

    let state = Arc::new(AppState {
        store,
        crypto,
        oauth,
        credentials,
        keys,
        rate_limiter,
        providers,
        model_cache: ModelCache::new(),
        http,
        control,
        site_url: config.site_url.clone(),
        cors_mode: config.cors_mode.clone(),
    });

    // Dashboard CORS is pinned to the configured client origins
    let client_urls = config.client_urls.clone();
    let dashboard_cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            origin
                .to_str()
                .map(|o| client_urls.iter().any(|allowed| allowed == o))
                .unwrap_or(false)
        }))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true);

    let v1_routes = Router::new()
        .route("/chat/completions", post(routes::openai::chat_completions))
        .route("/completions", post(routes::openai::legacy_completions))
        .route("/messages", post(routes::anthropic::messages))
        .route("/models", get(routes::openai::list_models))
        .route("/models/{model}", get(routes::openai::get_model))
        .route("/embeddings", post(routes::openai::not_implemented))
        .route("/moderations", post(routes::openai::not_implemented))
        .route("/images/{*rest}", any(routes::openai::not_implemented))
        .route("/audio/{*rest}", any(routes::openai::not_implemented))
        .fallback(routes::openai::unknown_endpoint)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            v1_cors_middleware,
        ));

    let dashboard_routes = Router::new()
        .route(
            "/keys",
            post(routes::dashboard::create_key).get(routes::dashboard::list_keys),
        )
        .route("/credentials", post(routes::dashboard::store_credential))
        .route("/oauth/status", get(routes::dashboard::oauth_status))
        .route("/oauth/start", post(routes::dashboard::oauth_start))
        .route("/oauth/callback", get(routes::dashboard::oauth_callback))
        .route("/oauth/exchange", post(routes::dashboard::oauth_exchange))
        .route("/oauth/disconnect", post(routes::dashboard::oauth_disconnect))
        .layer(dashboard_cors);

    let app = NormalizePath::trim_trailing_slash(
        Router::new()
            .route("/health", get(routes::health::health))
            .nest("/v1", v1_routes)
            .nest("/dashboard", dashboard_routes)
            .with_state(state),
    );

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .expect("Invalid address");
    info!("Starting modelgate v{}", routes::health::VERSION);
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(
        listener,
        ServiceExt::<axum::extract::Request>::into_make_service(app),
    )
    .await
    .unwrap();
}
