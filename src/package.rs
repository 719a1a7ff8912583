//! Package runtime - the contract a plugin implements.
//!
//! A package advertises a [`Trigger`], then answers messages through
//! [`PackageRuntime::run`] (first match) or [`PackageRuntime::follow_up`]
//! (continuation). Every invocation commits exactly one [`Response`] through a
//! [`ResponseSlot`].
//!
//! Out-of-process packages use [`Package`]: bind a local listener, register
//! with the router, serve `POST /run` and `POST /follow_up`, deregister on
//! shutdown.

use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response as HttpResponse},
    routing::post,
    Json, Router,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::message::{Message, Response, Trigger};

/// Errors a handler reports back to the router
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("Response was already saved")]
    AlreadySaved,

    #[error("Package answered {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("Package unreachable: {0}")]
    Unreachable(String),
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// Errors running an out-of-process package
#[derive(Error, Debug)]
pub enum PackageError {
    #[error("Failed to reach router: {0}")]
    Router(#[from] reqwest::Error),

    #[error("Router rejected {action} ({status}): {body}")]
    Rejected {
        action: &'static str,
        status: u16,
        body: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Write-once holder for a handler's response
#[derive(Debug, Default)]
pub struct ResponseSlot {
    response: Option<Response>,
}

impl ResponseSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit the response. A second save is refused.
    pub fn save(&mut self, response: Response) -> Result<(), HandlerError> {
        if self.response.is_some() {
            return Err(HandlerError::AlreadySaved);
        }
        self.response = Some(response);
        Ok(())
    }

    pub fn is_saved(&self) -> bool {
        self.response.is_some()
    }

    pub fn into_response(self) -> Option<Response> {
        self.response
    }
}

/// Two-method capability every package exposes
#[async_trait]
pub trait PackageRuntime: Send + Sync {
    /// First match of a message against the package's trigger
    async fn run(&self, message: &Message, slot: &mut ResponseSlot) -> Result<(), HandlerError>;

    /// Next message of a conversation this package asked to continue
    async fn follow_up(&self, message: &Message, slot: &mut ResponseSlot)
        -> Result<(), HandlerError>;
}

/// Which handler to call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation {
    Run,
    FollowUp,
}

impl Invocation {
    /// Route a remote package serves this invocation on
    pub fn route(self) -> &'static str {
        match self {
            Self::Run => "/run",
            Self::FollowUp => "/follow_up",
        }
    }
}

/// Call one handler with a fresh slot and hand the slot back
pub async fn invoke(
    runtime: &dyn PackageRuntime,
    invocation: Invocation,
    message: &Message,
) -> Result<ResponseSlot, HandlerError> {
    let mut slot = ResponseSlot::new();
    match invocation {
        Invocation::Run => runtime.run(message, &mut slot).await?,
        Invocation::FollowUp => runtime.follow_up(message, &mut slot).await?,
    }
    Ok(slot)
}

/// What a package tells the router about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub name: String,
    pub port: u16,
    pub trigger: Trigger,
}

/// Handle for a package running in its own process
pub struct Package {
    name: String,
    port: u16,
    trigger: Trigger,
    router_url: String,
    client: Client,
}

impl Package {
    pub fn new(
        name: impl Into<String>,
        port: u16,
        trigger: Trigger,
        router_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            port,
            trigger,
            router_url: router_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registration(&self) -> Registration {
        Registration {
            name: self.name.clone(),
            port: self.port,
            trigger: self.trigger.clone(),
        }
    }

    /// Announce this package to the router
    pub async fn register(&self) -> Result<(), PackageError> {
        let response = self
            .client
            .post(format!("{}/plugins", self.router_url))
            .json(&self.registration())
            .send()
            .await?;
        check_status("registration", response).await?;
        info!(package = %self.name, port = self.port, "Registered with router");
        Ok(())
    }

    /// Withdraw this package from the router
    pub async fn deregister(&self) -> Result<(), PackageError> {
        let response = self
            .client
            .delete(format!(
                "{}/plugins/{}",
                self.router_url,
                urlencoding::encode(&self.name)
            ))
            .send()
            .await?;
        check_status("deregistration", response).await?;
        info!(package = %self.name, "Deregistered from router");
        Ok(())
    }

    /// Serve until the process is stopped
    pub async fn serve(self, runtime: Arc<dyn PackageRuntime>) -> Result<(), PackageError> {
        self.serve_until(runtime, std::future::pending()).await
    }

    /// Bind, register, serve until `shutdown` resolves, then deregister.
    ///
    /// Port 0 binds an ephemeral port and registers the port actually bound.
    pub async fn serve_until<F>(
        mut self,
        runtime: Arc<dyn PackageRuntime>,
        shutdown: F,
    ) -> Result<(), PackageError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(("127.0.0.1", self.port)).await?;
        self.port = listener.local_addr()?.port();

        self.register().await?;
        info!(package = %self.name, port = self.port, "Package listening");

        let served = axum::serve(listener, package_router(runtime))
            .with_graceful_shutdown(shutdown)
            .await;

        if let Err(e) = self.deregister().await {
            warn!(package = %self.name, error = %e, "Failed to deregister");
        }
        served?;
        Ok(())
    }
}

async fn check_status(
    action: &'static str,
    response: reqwest::Response,
) -> Result<(), PackageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(PackageError::Rejected {
        action,
        status: status.as_u16(),
        body,
    })
}

/// Routes a package process serves to the router
pub fn package_router(runtime: Arc<dyn PackageRuntime>) -> Router {
    Router::new()
        .route("/run", post(handle_run))
        .route("/follow_up", post(handle_follow_up))
        .with_state(runtime)
}

async fn handle_run(
    State(runtime): State<Arc<dyn PackageRuntime>>,
    Json(message): Json<Message>,
) -> HttpResponse {
    answer(runtime.as_ref(), Invocation::Run, &message).await
}

async fn handle_follow_up(
    State(runtime): State<Arc<dyn PackageRuntime>>,
    Json(message): Json<Message>,
) -> HttpResponse {
    answer(runtime.as_ref(), Invocation::FollowUp, &message).await
}

async fn answer(runtime: &dyn PackageRuntime, invocation: Invocation, message: &Message) -> HttpResponse {
    debug!(route = invocation.route(), flex_id = %message.flex_id, "Package invoked");
    match invoke(runtime, invocation, message).await {
        Ok(slot) => match slot.into_response() {
            Some(response) => Json(response).into_response(),
            None => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "handler returned without saving a response",
            )
                .into_response(),
        },
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
