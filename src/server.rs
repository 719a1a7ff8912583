//! Router server - the central HTTP endpoint.
//!
//! Accepts commands tied to a conversation identity, dispatches them to the
//! matching package and answers with the package's sentence as plain text.
//! Out-of-process packages register and deregister themselves over `/plugins`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::dispatch::{DispatchError, Dispatcher, RegistrationError};
use crate::message::{FlexIdType, Message};
use crate::onboard::Onboard;
use crate::package::Registration;

/// Sentence returned when no package claims a command
pub const FALLBACK_SENTENCE: &str = "I'm not sure how to help with that yet.";

/// Shared state for the router
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<AppConfig>,
    pub dispatcher: Arc<Dispatcher>,
}

/// Errors that can occur while serving a request
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("No package named '{0}'")]
    UnknownPackage(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::InvalidIdentity(_) => StatusCode::BAD_REQUEST,
            ServerError::Dispatch(_) => StatusCode::BAD_GATEWAY,
            ServerError::Registration(_) => StatusCode::BAD_REQUEST,
            ServerError::UnknownPackage(_) => StatusCode::NOT_FOUND,
        };
        (status, self.to_string()).into_response()
    }
}

/// Query parameters of the command endpoint
#[derive(Debug, Default, Deserialize)]
pub struct CommandParams {
    #[serde(default)]
    pub flexidtype: Option<String>,
    #[serde(default)]
    pub flexid: Option<String>,
    #[serde(default)]
    pub cmd: Option<String>,
}

impl CommandParams {
    fn into_message(self) -> Result<Option<Message>, ServerError> {
        let cmd = self.cmd.unwrap_or_default();
        if cmd.trim().is_empty() {
            return Ok(None);
        }

        let code = self
            .flexidtype
            .as_deref()
            .unwrap_or_default()
            .trim()
            .parse::<u8>()
            .map_err(|_| ServerError::InvalidIdentity("flexidtype must be 1 or 2".to_string()))?;
        let flex_id_type = FlexIdType::try_from(code).map_err(ServerError::InvalidIdentity)?;
        let flex_id = self
            .flexid
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ServerError::InvalidIdentity("flexid is required".to_string()))?;

        Ok(Some(Message::new(flex_id_type, flex_id, cmd)))
    }
}

/// Create the router
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        // Command endpoint, also the console's connectivity probe
        .route("/", get(handle_command).post(handle_command))
        .route("/health", get(health_check))
        // Package registry
        .route("/plugins", get(list_packages).post(register_package))
        .route("/plugins/{name}", delete(unregister_package))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_command(
    State(state): State<ServerState>,
    Query(params): Query<CommandParams>,
) -> Result<String, ServerError> {
    let Some(message) = params.into_message()? else {
        debug!("Connectivity probe");
        return Ok(String::new());
    };

    match state.dispatcher.dispatch(&message).await {
        Ok(response) => Ok(response.sentence),
        Err(DispatchError::NoMatch) => Ok(FALLBACK_SENTENCE.to_string()),
        Err(e) => Err(e.into()),
    }
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "abot",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn list_packages(State(state): State<ServerState>) -> impl IntoResponse {
    Json(state.dispatcher.packages().await)
}

async fn register_package(
    State(state): State<ServerState>,
    Json(registration): Json<Registration>,
) -> Result<StatusCode, ServerError> {
    state.dispatcher.register_remote(registration).await?;
    Ok(StatusCode::CREATED)
}

async fn unregister_package(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ServerError> {
    if state.dispatcher.unregister(&name).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ServerError::UnknownPackage(name))
    }
}

/// The router process
pub struct Server {
    state: ServerState,
}

impl Server {
    /// Build the dispatcher and register built-in packages
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let dispatcher = Dispatcher::new(config.server.invoke_timeout())?;
        let onboard = Onboard::new(config.server.public_base_url());
        dispatcher
            .register(Onboard::NAME, Arc::new(onboard), Onboard::trigger())
            .await?;

        Ok(Self {
            state: ServerState {
                config: Arc::new(config),
                dispatcher: Arc::new(dispatcher),
            },
        })
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Serve until the process is stopped
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.state.config.server.bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(address = %addr, "Starting abot server");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    /// Serve until `shutdown_rx` flips to true
    pub async fn run_until(
        self,
        mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let addr = self.state.config.server.bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(address = %addr, "Starting abot server (with shutdown support)");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown_rx.changed().await.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping server...");
                        break;
                    }
                }
            })
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Trigger;
    use crate::package::{HandlerError, PackageRuntime, ResponseSlot};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    struct Status;

    #[async_trait]
    impl PackageRuntime for Status {
        async fn run(&self, message: &Message, slot: &mut ResponseSlot) -> Result<(), HandlerError> {
            slot.save(
                message
                    .new_response()
                    .with_sentence(format!("All systems go for {}", message.flex_id)),
            )
        }

        async fn follow_up(&self, _: &Message, _: &mut ResponseSlot) -> Result<(), HandlerError> {
            Err(HandlerError::failed("unexpected follow up"))
        }
    }

    struct Broken;

    #[async_trait]
    impl PackageRuntime for Broken {
        async fn run(&self, _: &Message, _: &mut ResponseSlot) -> Result<(), HandlerError> {
            Err(HandlerError::failed("database on fire"))
        }

        async fn follow_up(&self, _: &Message, _: &mut ResponseSlot) -> Result<(), HandlerError> {
            Err(HandlerError::failed("database on fire"))
        }
    }

    async fn test_app() -> (Router, ServerState) {
        let server = Server::new(AppConfig::default()).await.unwrap();
        let state = server.state().clone();
        state
            .dispatcher
            .register("status", Arc::new(Status), Trigger::new(["status"]))
            .await
            .unwrap();
        state
            .dispatcher
            .register("broken", Arc::new(Broken), Trigger::new(["explode"]))
            .await
            .unwrap();
        (server.router(), state)
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_probe_answers_empty() {
        let (app, _) = test_app().await;
        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "");
    }

    #[tokio::test]
    async fn test_command_dispatches() {
        let (app, _) = test_app().await;
        let response = app
            .oneshot(
                Request::post("/?flexidtype=2&flexid=%2B15555550100&cmd=status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/plain; charset=utf-8"
        );
        assert_eq!(body_text(response).await, "All systems go for +15555550100");
    }

    #[tokio::test]
    async fn test_no_match_uses_fallback() {
        let (app, _) = test_app().await;
        let response = app
            .oneshot(
                Request::get("/?flexidtype=1&flexid=a%40example.org&cmd=sing%20a%20song")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, FALLBACK_SENTENCE);
    }

    #[tokio::test]
    async fn test_handler_failure_is_bad_gateway() {
        let (app, _) = test_app().await;
        let response = app
            .oneshot(
                Request::post("/?flexidtype=2&flexid=1&cmd=explode")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(body_text(response).await.contains("database on fire"));
    }

    #[tokio::test]
    async fn test_bad_identity_is_bad_request() {
        for uri in [
            "/?flexidtype=7&flexid=1&cmd=status",
            "/?flexidtype=phone&flexid=1&cmd=status",
            "/?flexidtype=2&cmd=status",
        ] {
            let (app, _) = test_app().await;
            let response = app
                .oneshot(Request::post(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        }
    }

    #[tokio::test]
    async fn test_builtin_onboard_registered() {
        let (app, _) = test_app().await;
        let response = app
            .oneshot(
                Request::get("/?flexidtype=2&flexid=%2B15555550100&cmd=onboard%20me")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let text = body_text(response).await;
        assert!(text.starts_with("Hi, I'm Abot."), "{text}");
        assert!(text.contains("http://localhost:4200/signup?"), "{text}");
    }

    #[tokio::test]
    async fn test_register_and_unregister_remote() {
        let (app, state) = test_app().await;

        let response = app
            .clone()
            .oneshot(
                Request::post("/plugins")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"name": "weather", "port": 4301, "trigger": ["weather"]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(state
            .dispatcher
            .packages()
            .await
            .iter()
            .any(|p| p.name == "weather" && p.port == Some(4301)));

        let response = app
            .clone()
            .oneshot(Request::delete("/plugins/weather").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(Request::delete("/plugins/weather").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_register_rejects_empty_trigger() {
        let (app, _) = test_app().await;
        let response = app
            .oneshot(
                Request::post("/plugins")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"name": "mute", "port": 4302, "trigger": []}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_register_rejects_multi_word_keyword() {
        let (app, state) = test_app().await;
        let response = app
            .oneshot(
                Request::post("/plugins")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"name": "signup", "port": 4303, "trigger": ["sign up"]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("sign up"));
        assert!(state
            .dispatcher
            .packages()
            .await
            .iter()
            .all(|p| p.name != "signup"));
    }

    #[tokio::test]
    async fn test_list_packages() {
        let (app, _) = test_app().await;
        let response = app
            .oneshot(Request::get("/plugins").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        let names: Vec<&str> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["broken", "onboard", "status"]);
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = test_app().await;
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }
}
