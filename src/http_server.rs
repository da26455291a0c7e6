//! HTTP boundary for the supervision tree.
//!
//! Exposes one `POST /commands/{Name}` route per command known anywhere in the
//! tree, with one extra path segment per declared input parameter, plus fixed
//! liveness/readiness endpoints.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;

use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::daemon::{Daemon, DaemonCommand, HealthStatus, Params};

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    /// Port to listen on.
    pub port: u16,
    /// Host to bind to.
    pub host: String,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            port: 14740,
            host: "127.0.0.1".to_string(),
        }
    }
}

/// HTTP server that turns requests into daemon commands.
pub struct HttpServer {
    config: HttpServerConfig,
    root: Daemon,
}

impl HttpServer {
    /// Create a new HTTP server in front of `root`.
    pub fn new(config: HttpServerConfig, root: Daemon) -> Self {
        Self { config, root }
    }

    /// Serve until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.build_router();

        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port).parse()?;

        tracing::info!("Starting HTTP server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    pub fn build_router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let ready_root = self.root.clone();
        let list_root = self.root.clone();
        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/ready", get(move || ready_handler(ready_root.clone())))
            .route("/commands", get(move || commands_handler(list_root.clone())));

        for (name, command) in self.root.get_commands() {
            let path = command_path(&command);
            tracing::debug!(command = %name, path = %path, "Registering command route");

            let root = self.root.clone();
            router = if command.input_param_names().is_empty() {
                router.route(
                    &path,
                    post(move || execute(root.clone(), command.clone(), HashMap::new())),
                )
            } else {
                router.route(
                    &path,
                    post(move |Path(segments): Path<HashMap<String, String>>| {
                        execute(root.clone(), command.clone(), segments)
                    }),
                )
            };
        }

        router.layer(cors).layer(TraceLayer::new_for_http())
    }
}

/// `/commands/{Name}` followed by one `/{param}` capture per input parameter.
pub fn command_path(command: &DaemonCommand) -> String {
    let mut path = format!("/commands/{}", command.command_name());
    for param in command.input_param_names() {
        path.push_str(&format!("/{{{}}}", param));
    }
    path
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn ready_handler(root: Daemon) -> (StatusCode, Json<Value>) {
    let status = HealthStatus::of(&root);
    let code = if status.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(json!(status)))
}

async fn commands_handler(root: Daemon) -> Json<Value> {
    let commands: Vec<Value> = root
        .get_commands()
        .values()
        .map(|command| {
            json!({
                "name": command.command_name(),
                "path": command_path(command),
                "target_state": command.target_state().ok().map(|s| s.state_name()),
                "input_param_names": command.input_param_names(),
            })
        })
        .collect();
    Json(json!({ "commands": commands }))
}

async fn execute(
    root: Daemon,
    command: DaemonCommand,
    segments: HashMap<String, String>,
) -> (StatusCode, Json<Value>) {
    let name = command.command_name().to_string();
    let params: Params = segments
        .into_iter()
        .map(|(key, value)| (key, Value::String(value)))
        .collect();

    let outcome =
        tokio::task::spawn_blocking(move || root.submit_command(command, params)).await;

    match outcome {
        Ok(Ok(results)) => (
            StatusCode::OK,
            Json(json!({ "command": name, "results": results })),
        ),
        Ok(Err(e)) => {
            let code = if e.is_unavailable() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            tracing::warn!(command = %name, error = %e, "Command failed");
            (code, Json(json!({ "command": name, "error": e.to_string() })))
        }
        Err(e) => {
            tracing::error!(command = %name, error = %e, "Command task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "command": name, "error": e.to_string() })),
            )
        }
    }
}
