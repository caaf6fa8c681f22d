mod telemetry;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use telemetry::Fleet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const MAX_PAGE_SIZE: usize = 1000;

/// Emulates the sensor vendor API with synthetic readings.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, env = "SIM_ADDR", default_value = "0.0.0.0:8090")]
    listen: String,

    /// Number of simulated devices
    #[arg(long, env = "DEVICES", default_value_t = 5)]
    devices: usize,

    /// Seconds between readings of one device
    #[arg(long, env = "READING_INTERVAL_SECS", default_value_t = 300)]
    interval_secs: i64,

    /// How far back the reading history goes at startup
    #[arg(long, env = "HISTORY_HOURS", default_value_t = 72)]
    history_hours: i64,

    /// Share of readings that are deliberately malformed
    #[arg(long, env = "INVALID_RATIO", default_value_t = 0.01)]
    invalid_ratio: f64,

    /// Share of data requests answered with 503
    #[arg(long, env = "FAIL_RATIO", default_value_t = 0.0)]
    fail_ratio: f64,

    #[arg(long, env = "SOURCE_CLIENT_ID", default_value = "simulator")]
    client_id: String,

    #[arg(long, env = "SOURCE_CLIENT_SECRET", default_value = "simulator")]
    client_secret: String,
}

#[derive(Clone)]
struct AppState {
    fleet: Arc<Fleet>,
    client_id: String,
    client_secret: String,
    fail_ratio: f64,
    tokens: Arc<Mutex<HashSet<String>>>,
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    client_id: String,
    client_secret: String,
    grant_type: String,
}

#[derive(Debug, Deserialize)]
struct ReadingsQuery {
    since: Option<DateTime<Utc>>,
    page_size: Option<usize>,
    page_token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.interval_secs > 0, "reading interval must be positive");
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.invalid_ratio) && (0.0..=1.0).contains(&args.fail_ratio),
        "ratios must be within [0, 1]"
    );

    let now = Utc::now();
    let fleet = Fleet {
        device_ids: (0..args.devices).map(|i| format!("sim-{}", i)).collect(),
        first_reading_at: now - Duration::hours(args.history_hours),
        interval: Duration::seconds(args.interval_secs),
        invalid_ratio: args.invalid_ratio,
    };

    info!("Starting sensor API simulator");
    info!(
        "Devices: {}, interval: {}s, history: {}h",
        args.devices, args.interval_secs, args.history_hours
    );

    let state = AppState {
        fleet: Arc::new(fleet),
        client_id: args.client_id,
        client_secret: args.client_secret,
        fail_ratio: args.fail_ratio,
        tokens: Arc::new(Mutex::new(HashSet::new())),
    };

    let app = Router::new()
        .route("/v1/oauth/token", post(issue_token))
        .route("/v1/devices", get(list_devices))
        .route("/v1/devices/:id/readings", get(get_readings))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!("Simulator listening on {}", args.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await?;

    Ok(())
}

async fn issue_token(
    State(state): State<AppState>,
    Json(req): Json<TokenRequest>,
) -> Result<Json<Value>, AppError> {
    if req.client_id != state.client_id || req.client_secret != state.client_secret {
        warn!(grant = %req.grant_type, "Rejected token request");
        return Err(AppError(
            StatusCode::UNAUTHORIZED,
            "invalid client credentials".into(),
        ));
    }

    let token = uuid::Uuid::new_v4().to_string();
    state
        .tokens
        .lock()
        .map_err(|_| AppError::internal("token store poisoned"))?
        .insert(token.clone());
    info!(grant = %req.grant_type, "Issued access token");

    Ok(Json(json!({
        "access_token": token,
        "token_type": "Bearer",
        "refresh_token": uuid::Uuid::new_v4().to_string(),
        "expires_in": 3600,
    })))
}

async fn list_devices(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    authorize(&state, &headers)?;

    let devices: Vec<Value> = state
        .fleet
        .device_ids
        .iter()
        .map(|id| {
            json!({
                "device_id": id,
                "description": format!("Simulated sensor {}", id),
                "first_seen_at": state.fleet.first_reading_at,
            })
        })
        .collect();

    Ok(Json(json!({ "devices": devices })))
}

async fn get_readings(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<ReadingsQuery>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    authorize(&state, &headers)?;
    maybe_fail(state.fail_ratio)?;

    let fleet = &state.fleet;
    let device = fleet
        .device_index(&device_id)
        .ok_or_else(|| {
            AppError(
                StatusCode::NOT_FOUND,
                format!("unknown device {}", device_id),
            )
        })?;

    let page_size = params.page_size.unwrap_or(100).clamp(1, MAX_PAGE_SIZE);
    let since = params.since.unwrap_or(DateTime::<Utc>::MIN_UTC);
    let start = match params.page_token.as_deref() {
        Some(token) => token
            .parse::<u64>()
            .map_err(|_| AppError(StatusCode::BAD_REQUEST, "invalid page token".into()))?,
        None => fleet.first_index_after(since),
    };

    // New readings appear as time passes, like a live device.
    let (readings, next) = fleet.page(device, start, page_size, Utc::now());
    let next_page_token = next.map(|n| n.to_string());

    Ok(Json(json!({
        "readings": readings,
        "next_page_token": next_page_token,
    })))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| AppError(StatusCode::UNAUTHORIZED, "missing bearer token".into()))?;

    let known = state
        .tokens
        .lock()
        .map_err(|_| AppError::internal("token store poisoned"))?
        .contains(token);
    if known {
        Ok(())
    } else {
        Err(AppError(StatusCode::UNAUTHORIZED, "unknown token".into()))
    }
}

fn maybe_fail(ratio: f64) -> Result<(), AppError> {
    if ratio > 0.0 && rand::thread_rng().gen_bool(ratio) {
        warn!("Injecting 503");
        return Err(AppError(
            StatusCode::SERVICE_UNAVAILABLE,
            "simulated outage".into(),
        ));
    }
    Ok(())
}

struct AppError(StatusCode, String);

impl AppError {
    fn internal(msg: &str) -> Self {
        Self(StatusCode::INTERNAL_SERVER_ERROR, msg.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.0.is_server_error() {
            warn!("API error: {}", self.1);
        }
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}
