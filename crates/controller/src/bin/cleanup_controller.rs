/*
 * Pod Cleanup Operator - Kubernetes controller for PodCleanupPolicy resources
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Controller Service - Kubernetes controller for `PodCleanupPolicy` resources
//!
//! This service:
//! - Watches cluster-scoped `PodCleanupPolicy` resources
//! - Deletes the pods each policy selects, on its cron schedule
//! - Serves health and readiness endpoints

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use pod_cleanup_controller::tasks::config::{ControllerConfig, LogFormat, DEFAULT_CONFIG_PATH};
use pod_cleanup_controller::tasks::run_cleanup_controller;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
struct AppState {
    controller_running: Arc<AtomicBool>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Config is read before tracing is up, so load errors are reported after init
    let (controller_config, load_error) = load_controller_config();
    init_tracing(controller_config.logging.format);

    info!(
        "Starting Pod Cleanup Controller v{}",
        env!("CARGO_PKG_VERSION")
    );
    if let Some(err) = load_error {
        warn!("{err}. Using defaults.");
    }
    controller_config
        .validate()
        .map_err(|e| format!("Invalid controller configuration: {e}"))?;
    let controller_config = Arc::new(controller_config);

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let controller_running = Arc::new(AtomicBool::new(true));
    let state = AppState {
        controller_running: controller_running.clone(),
    };

    // Start the controller in the background
    let controller_handle = {
        let config = controller_config.clone();
        tokio::spawn(async move {
            if let Err(e) = run_cleanup_controller(client, config).await {
                error!("Controller error: {}", e);
            }
            controller_running.store(false, Ordering::SeqCst);
        })
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        )
        .with_state(state);

    let bind_address = controller_config.server.bind_address.as_str();
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("Controller HTTP server listening on {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The controller stops on the same signal; give it a moment to drain
    if tokio::time::timeout(Duration::from_secs(10), controller_handle)
        .await
        .is_err()
    {
        warn!("Controller did not stop within 10s");
    }
    info!("Controller service stopped");

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,pod_cleanup_controller=debug,kube=warn".into());

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

fn load_controller_config() -> (ControllerConfig, Option<String>) {
    let override_path = std::env::var("CONTROLLER_CONFIG_PATH").ok();
    let config_path = override_path.as_deref().unwrap_or(DEFAULT_CONFIG_PATH);

    if !Path::new(config_path).exists() {
        return (
            ControllerConfig::default(),
            Some(format!("Configuration file {config_path} not found")),
        );
    }

    match ControllerConfig::from_mounted_file(config_path) {
        Ok(cfg) => (cfg, None),
        Err(err) => (
            ControllerConfig::default(),
            Some(format!(
                "Failed to load configuration from {config_path}: {err}"
            )),
        ),
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "pod-cleanup-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if !state.controller_running.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "status": "ready",
        "service": "pod-cleanup-controller",
        "version": env!("CARGO_PKG_VERSION")
    })))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
