use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Router,
};
use clap::Parser;
use hf_hub::api::tokio::Api;
use serde::Serialize;
use sumi_core::{
    DeviceMap, EventHandler, EventResponse, Executor, GenerationEvent, HandlerConfig,
    HttpFetcher, Pipeline, SinkBackend, StableDiffusionLoader, StableDiffusionSafetyChecker,
};
use tokio::{net::TcpListener, sync::Mutex};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Sumi image generation event server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

#[derive(Serialize)]
struct ErrorResponse {
    #[serde(rename = "statusCode")]
    status_code: u16,
    error: String,
}

type Handler = EventHandler<StableDiffusionLoader, HttpFetcher, SinkBackend>;

struct AppState {
    handler: Handler,
    // One request in flight per instance.
    slot: Mutex<()>,
}

async fn generate_image_handler(
    State(state): State<Arc<AppState>>,
    Json(event): Json<GenerationEvent>,
) -> impl IntoResponse {
    match handle_event(event, &state).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            error!(error = %e, "error generating image");
            let body = ErrorResponse {
                status_code: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                error: format!("{e:#}"),
            };
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}

async fn handle_event(event: GenerationEvent, state: &AppState) -> Result<EventResponse> {
    let _slot = state.slot.lock().await;
    Ok(state.handler.handle(event).await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = HandlerConfig::from_env().context("invalid handler configuration")?;
    info!(bucket = %config.bucket, sink = ?config.sink, "loaded handler configuration");

    let api = Api::new()?;
    let device_map = DeviceMap::from_cpu_flag(args.cpu);
    // The safety checker stays resident; engines are loaded per event.
    let checker = StableDiffusionSafetyChecker::load(&api, &config.safety_checker, device_map)
        .await
        .context("failed to load safety checker")?;
    let loader = StableDiffusionLoader::new(api, device_map);
    let executor = Executor::new(loader, HttpFetcher::default()).with_safety_checker(Arc::new(checker));
    let pipeline = Pipeline::new(executor, config.persister().await);

    let shared_state = Arc::new(AppState {
        handler: EventHandler::new(pipeline),
        slot: Mutex::new(()),
    });

    // --- Build axum router with shared state ---
    let app = Router::new()
        .route("/v1/images/generations", post(generate_image_handler))
        .with_state(shared_state);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
