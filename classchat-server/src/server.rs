use axum::{Extension, Router, middleware, response::IntoResponse, routing::get, serve};
use shared::{
    config::server::{Config, DatabaseConfig, LogFormat},
    models::ReconciliationSummary,
};
use sqlx::postgres::PgPoolOptions;
use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};
use thiserror::Error;
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

use crate::{
    app_state::{AppState, Dependencies},
    bridge::{DeliverySink, FanoutRouter, HubHandle, HubSupervisor, WebSocketTransport, hub},
    cache::{self, CacheBackend, memory::MemoryBackend},
    db::bootstrap::{self, BootstrapError},
    middleware::request_context::{self, RequestIdState},
    routes::{self, openapi::openapi_routes},
    services::reconciliation::{ReconciliationError, ReconciliationWorker},
    store::{PgDirectory, PgMessageStore, PgReceiptStore},
    tracer,
};
use axum::http::{HeaderValue, StatusCode, header};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Failures that stop the process before or while serving.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("database unavailable: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),
    #[error("failed to bind or serve: {0}")]
    Io(#[from] std::io::Error),
}

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub(crate) fn metrics_handle() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if let Err(err) = metrics::set_global_recorder(recorder) {
                warn!(error = %err, "metrics recorder already installed");
            }
            handle
        })
        .clone()
}

async fn metrics_endpoint(Extension(handle): Extension<PrometheusHandle>) -> impl IntoResponse {
    handle.run_upkeep();
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        handle.render(),
    )
}

/// Initializes the tracing subscriber for logging using the provided configuration.
pub fn initialize_tracing(config: &Config) -> String {
    let env_filter = build_env_filter(config);

    let fmt_builder = fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    let installed = if matches!(config.logging.format, LogFormat::Json) {
        fmt_builder.json().with_ansi(false).try_init()
    } else {
        fmt_builder.with_ansi(true).try_init()
    };
    if installed.is_err() {
        warn!("tracing subscriber already installed");
    }

    config.logging.level.clone()
}

fn build_env_filter(config: &Config) -> EnvFilter {
    let default_level = config
        .logging
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    })
}

/// Creates a database connection pool from the given database settings.
///
/// # Errors
/// Returns an error if the database connection pool cannot be created.
pub async fn create_database_pool(db: &DatabaseConfig) -> Result<sqlx::PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(db.max_connections)
        .acquire_timeout(Duration::from_millis(db.statement_timeout_ms))
        .connect(&db.url)
        .await?;
    #[allow(clippy::cast_precision_loss)]
    let statement_timeout = db.statement_timeout_ms as f64;
    metrics::gauge!("db_pool_max_connections").set(f64::from(db.max_connections));
    metrics::gauge!("db_statement_timeout_ms").set(statement_timeout);
    Ok(pool)
}

/// Connects and prepares the durable tier: liveness, optional bootstrap, readiness.
///
/// # Errors
/// Any failure here is a configuration-level failure and halts startup.
pub async fn prepare_database(db: &DatabaseConfig) -> Result<sqlx::PgPool, StartupError> {
    let pool = create_database_pool(db).await?;
    bootstrap::ensure_liveness(&pool).await?;
    if db.run_bootstrap {
        let applied = bootstrap::run(&pool, db).await?;
        info!(applied, "database bootstrap complete");
    }
    bootstrap::ensure_readiness(&pool).await?;
    Ok(pool)
}

/// Connects the cache tier, degrading to the in-process backend when Redis is unreachable.
pub async fn connect_cache(config: &Config) -> Arc<dyn CacheBackend> {
    match cache::connect_backend(&config.cache).await {
        Ok(backend) => backend,
        Err(err) => {
            metrics::counter!("classchat_cache_fallbacks_total").increment(1);
            warn!(error = %err, "cache unavailable at startup; using in-process backend");
            Arc::new(MemoryBackend::new())
        }
    }
}

/// Creates the CORS layer for the application.
pub fn create_cors_layer(config: &Config) -> CorsLayer {
    use http::Method;

    let methods = vec![Method::GET, Method::POST, Method::OPTIONS];

    let mut cors = CorsLayer::new()
        .allow_methods(AllowMethods::list(methods))
        .allow_headers(AllowHeaders::any())
        .allow_credentials(config.server.cors.allow_credentials)
        .max_age(Duration::from_secs(config.server.cors.max_age_seconds));

    if config.server.cors.allowed_origins.is_empty() {
        cors = cors.allow_origin(AllowOrigin::any());
    } else {
        let origins = config
            .server
            .cors
            .allowed_origins
            .iter()
            .filter_map(|origin| http::HeaderValue::from_str(origin).ok())
            .collect::<Vec<_>>();
        cors = cors.allow_origin(AllowOrigin::list(origins));
    }

    cors
}

/// Creates the API router, honoring the feature flags.
pub fn create_api_router(config: &Config) -> Router<Arc<AppState>> {
    let mut router = Router::new().merge(routes::chats::create_chat_router());

    if config.features.admin_api {
        router = router.merge(routes::admin::create_router_admin());
    }

    if config.features.sse_v1 {
        router = router.route(
            "/stream",
            get(crate::handlers::streaming::sse_handler),
        );
    }

    router
}

/// Creates the main application router with all middleware and routes.
pub fn create_app_router(
    state: Arc<AppState>,
    config: Arc<Config>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let cors = create_cors_layer(&config);
    let request_id_state = RequestIdState::from_config(&config);

    Router::new()
        .nest("/api", create_api_router(&config))
        .merge(routes::health::create_health_router())
        .route("/metrics", get(metrics_endpoint))
        .merge(openapi_routes())
        .layer(Extension(config))
        .layer(Extension(metrics_handle))
        .layer(cors)
        .layer(tracer::create_trace_layer())
        .layer(middleware::from_fn_with_state(
            request_id_state,
            request_context::assign_request_id,
        ))
        .with_state(state)
}

/// Resolves on Ctrl-C or when `shutdown` is cancelled elsewhere, cancelling it either way.
pub async fn create_shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "failed to listen for ctrl-c");
            }
        }
        () = shutdown.cancelled() => {}
    }
    info!("Shutting down...");
    shutdown.cancel();
}

fn connect_hub(config: &Config) -> Option<(HubSupervisor<WebSocketTransport>, HubHandle)> {
    if !config.hub.enabled {
        info!("upstream hub disabled");
        return None;
    }
    let (supervisor, handle) = hub::channel(
        WebSocketTransport::new(config.hub.url.clone()),
        config.hub.clone(),
    );
    Some((supervisor, handle))
}

fn spawn_background(
    tasks: &mut JoinSet<()>,
    state: &AppState,
    config: &Config,
    supervisor: Option<HubSupervisor<WebSocketTransport>>,
    shutdown: &CancellationToken,
) {
    if let (Some(supervisor), Some(handle)) = (supervisor, state.hub.as_ref()) {
        let router = Arc::new(FanoutRouter::new(
            state.read_state.clone(),
            Arc::clone(&state.directory),
            Arc::clone(&state.delivery) as Arc<dyn DeliverySink>,
            Duration::from_millis(config.hub.event_timeout_ms),
            config.hub.max_in_flight,
        ));
        tasks.spawn(router.run(handle.subscribe(), shutdown.clone()));
        tasks.spawn(supervisor.run(shutdown.clone()));
    }

    if config.features.sse_v1 {
        tasks.spawn(Arc::clone(&state.delivery).run_sweeper(shutdown.clone()));
    }

    if config.reconciliation.enabled {
        tasks.spawn(state.reconciliation.clone().run(shutdown.clone()));
    } else {
        info!("periodic reconciliation disabled");
    }
}

/// Starts the server and binds it to the configured port.
///
/// # Errors
/// Returns an error if the durable store is unusable or the listener cannot be bound.
pub async fn run(config: Config) -> Result<(), StartupError> {
    initialize_tracing(&config);
    info!(profile = ?config.profile, "Starting server...");

    let metrics_handle = metrics_handle();
    let config = Arc::new(config);
    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let pool = prepare_database(&config.db).await?;
    let cache = connect_cache(&config).await;
    let (supervisor, hub_handle) = connect_hub(&config).unzip();

    let state = Arc::new(AppState::build(
        Dependencies {
            pool: Some(pool.clone()),
            messages: Arc::new(PgMessageStore::new(pool.clone())),
            receipts: Arc::new(PgReceiptStore::new(pool.clone())),
            directory: Arc::new(PgDirectory::new(pool)),
            cache,
            hub: hub_handle,
            shutdown: shutdown.clone(),
        },
        &config,
    ));
    spawn_background(&mut tasks, &state, &config, supervisor, &shutdown);

    let app = create_app_router(Arc::clone(&state), Arc::clone(&config), metrics_handle);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], config.server.port)));
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    let served = serve(listener, app)
        .with_graceful_shutdown(create_shutdown_signal(shutdown.clone()))
        .await;
    shutdown.cancel();

    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "background task ended abnormally");
        }
    }
    info!("background tasks stopped");

    served.map_err(StartupError::from)
}

/// Runs a single reconciliation pass against the configured tiers and exits.
///
/// # Errors
/// Returns an error when the durable store is unusable or the key scan fails.
pub async fn run_reconciliation(config: Config) -> Result<ReconciliationSummary, StartupError> {
    initialize_tracing(&config);
    let pool = prepare_database(&config.db).await?;
    let cache = connect_cache(&config).await;

    let worker = ReconciliationWorker::new(
        crate::cache::SeenByTracker::new(cache, &config.cache),
        Arc::new(PgReceiptStore::new(pool)),
        config.reconciliation.clone(),
    );
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });

    Ok(worker.run_once(&shutdown).await?)
}
