//! Message dispatch - trigger table, continuation bindings, remote packages.
//!
//! A message goes to the package its conversation is bound to, if any;
//! otherwise to the package whose trigger best matches the message commands:
//!
//! 1. most distinct keywords present in the message
//! 2. then the longest matched keyword
//! 3. then the package name, ascending
//!
//! The result never depends on registration order.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::message::{ConversationKey, Message, Response, Trigger};
use crate::package::{invoke, HandlerError, Invocation, PackageRuntime, Registration, ResponseSlot};

/// Why a message produced no response
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("No package matched the message")]
    NoMatch,

    #[error("Package '{package}' failed: {source}")]
    Handler {
        package: String,
        #[source]
        source: HandlerError,
    },

    #[error("Package '{package}' returned without saving a response")]
    NotSaved { package: String },
}

/// Invalid registrations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("Package name must not be empty")]
    EmptyName,

    #[error("Package '{0}' declares no trigger keywords")]
    EmptyTrigger(String),

    #[error("Package '{package}' trigger keyword '{keyword}' is not a single word and can never match")]
    UnmatchableKeyword { package: String, keyword: String },
}

/// Public view of one registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageInfo {
    pub name: String,
    pub trigger: Trigger,
    /// Listen port for out-of-process packages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

struct Registered {
    runtime: Arc<dyn PackageRuntime>,
    trigger: Trigger,
    port: Option<u16>,
}

#[derive(Default)]
struct Tables {
    packages: BTreeMap<String, Registered>,
    /// keyword -> names of packages claiming it
    keywords: HashMap<String, BTreeSet<String>>,
}

impl Tables {
    fn insert(&mut self, name: String, registered: Registered) {
        self.remove(&name);
        for keyword in registered.trigger.commands() {
            self.keywords
                .entry(keyword.clone())
                .or_default()
                .insert(name.clone());
        }
        self.packages.insert(name, registered);
    }

    fn remove(&mut self, name: &str) -> bool {
        let Some(old) = self.packages.remove(name) else {
            return false;
        };
        for keyword in old.trigger.commands() {
            if let Some(names) = self.keywords.get_mut(keyword) {
                names.remove(name);
                if names.is_empty() {
                    self.keywords.remove(keyword);
                }
            }
        }
        true
    }

    fn best_match(&self, commands: &[String]) -> Option<String> {
        // name -> (matched keywords, longest matched keyword)
        let mut scores: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
        let mut seen = HashSet::new();
        for command in commands {
            if !seen.insert(command.as_str()) {
                continue;
            }
            if let Some(names) = self.keywords.get(command) {
                for name in names {
                    let score = scores.entry(name.as_str()).or_default();
                    score.0 += 1;
                    score.1 = score.1.max(command.chars().count());
                }
            }
        }
        scores
            .into_iter()
            .max_by(|(name_a, score_a), (name_b, score_b)| {
                score_a.cmp(score_b).then_with(|| name_b.cmp(name_a))
            })
            .map(|(name, _)| name.to_string())
    }
}

/// Routes messages to registered packages
pub struct Dispatcher {
    tables: RwLock<Tables>,
    continuations: RwLock<HashMap<ConversationKey, String>>,
    client: Client,
}

impl Dispatcher {
    /// Dispatcher whose remote invocations time out after `invoke_timeout`
    pub fn new(invoke_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(invoke_timeout).build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            continuations: RwLock::new(HashMap::new()),
            client,
        }
    }

    /// Register an in-process package. Re-registering a name replaces it.
    pub async fn register(
        &self,
        name: impl Into<String>,
        runtime: Arc<dyn PackageRuntime>,
        trigger: Trigger,
    ) -> Result<(), RegistrationError> {
        self.insert(name.into(), runtime, trigger, None).await
    }

    /// Register a package served by another process on localhost
    pub async fn register_remote(&self, registration: Registration) -> Result<(), RegistrationError> {
        let runtime = Arc::new(RemotePackage::new(self.client.clone(), registration.port));
        self.insert(
            registration.name,
            runtime,
            registration.trigger,
            Some(registration.port),
        )
        .await
    }

    async fn insert(
        &self,
        name: String,
        runtime: Arc<dyn PackageRuntime>,
        trigger: Trigger,
        port: Option<u16>,
    ) -> Result<(), RegistrationError> {
        if name.trim().is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        if trigger.is_empty() {
            return Err(RegistrationError::EmptyTrigger(name));
        }
        if let Some(keyword) = trigger.unmatchable() {
            return Err(RegistrationError::UnmatchableKeyword {
                keyword: keyword.to_string(),
                package: name,
            });
        }

        info!(package = %name, trigger = ?trigger.commands(), port = ?port, "Registered package");
        // Lock order is tables, then continuations
        let mut tables = self.tables.write().await;
        let mut continuations = self.continuations.write().await;
        tables.insert(
            name.clone(),
            Registered {
                runtime,
                trigger,
                port,
            },
        );
        // A replaced package starts with no open conversations
        continuations.retain(|_, bound| bound.as_str() != name);
        Ok(())
    }

    /// Remove a package and every conversation bound to it
    pub async fn unregister(&self, name: &str) -> bool {
        let mut tables = self.tables.write().await;
        let mut continuations = self.continuations.write().await;
        let removed = tables.remove(name);
        if removed {
            continuations.retain(|_, bound| bound.as_str() != name);
            info!(package = %name, "Unregistered package");
        }
        removed
    }

    /// Registrations sorted by name
    pub async fn packages(&self) -> Vec<PackageInfo> {
        self.tables
            .read()
            .await
            .packages
            .iter()
            .map(|(name, registered)| PackageInfo {
                name: name.clone(),
                trigger: registered.trigger.clone(),
                port: registered.port,
            })
            .collect()
    }

    /// Package the conversation is currently bound to
    pub async fn continuation(&self, key: &ConversationKey) -> Option<String> {
        self.continuations.read().await.get(key).cloned()
    }

    /// Route one message and return the committed response
    pub async fn dispatch(&self, message: &Message) -> Result<Response, DispatchError> {
        let span = info_span!(
            "dispatch",
            request_id = %Uuid::new_v4(),
            flex_id_type = %message.flex_id_type,
        );
        self.dispatch_inner(message).instrument(span).await
    }

    async fn dispatch_inner(&self, message: &Message) -> Result<Response, DispatchError> {
        let key = message.conversation();
        let (name, runtime, invocation) = self.route(&key, message).await?;
        debug!(package = %name, invocation = ?invocation, "Invoking package");

        let outcome = invoke(runtime.as_ref(), invocation, message).await;
        let response = match outcome.map(ResponseSlot::into_response) {
            Ok(Some(response)) => response,
            Ok(None) => {
                self.continuations.write().await.remove(&key);
                warn!(package = %name, "Package did not save a response");
                return Err(DispatchError::NotSaved { package: name });
            }
            Err(source) => {
                self.continuations.write().await.remove(&key);
                warn!(package = %name, error = %source, "Package failed");
                return Err(DispatchError::Handler {
                    package: name,
                    source,
                });
            }
        };

        let mut continuations = self.continuations.write().await;
        if response.follow_up {
            continuations.insert(key, name);
        } else {
            continuations.remove(&key);
        }
        Ok(response)
    }

    async fn route(
        &self,
        key: &ConversationKey,
        message: &Message,
    ) -> Result<(String, Arc<dyn PackageRuntime>, Invocation), DispatchError> {
        let tables = self.tables.read().await;
        let bound = self.continuations.read().await.get(key).cloned();

        if let Some(name) = bound {
            if let Some(registered) = tables.packages.get(&name) {
                return Ok((name, registered.runtime.clone(), Invocation::FollowUp));
            }
        }

        let name = tables
            .best_match(&message.structured.commands)
            .ok_or(DispatchError::NoMatch)?;
        let runtime = tables
            .packages
            .get(&name)
            .map(|registered| registered.runtime.clone())
            .ok_or(DispatchError::NoMatch)?;
        Ok((name, runtime, Invocation::Run))
    }
}

/// A package served by another process, reached over HTTP
pub struct RemotePackage {
    client: Client,
    base_url: String,
}

impl RemotePackage {
    /// Package listening on `127.0.0.1:<port>`
    pub fn new(client: Client, port: u16) -> Self {
        Self::with_base_url(client, format!("http://127.0.0.1:{}", port))
    }

    pub fn with_base_url(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn call(
        &self,
        invocation: Invocation,
        message: &Message,
        slot: &mut ResponseSlot,
    ) -> Result<(), HandlerError> {
        let url = format!("{}{}", self.base_url, invocation.route());
        let response = self
            .client
            .post(&url)
            .json(message)
            .send()
            .await
            .map_err(|e| HandlerError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HandlerError::Remote {
                status: status.as_u16(),
                body,
            });
        }

        let answer: Response = response
            .json()
            .await
            .map_err(|e| HandlerError::failed(format!("Malformed package response: {}", e)))?;
        slot.save(answer)
    }
}

#[async_trait]
impl PackageRuntime for RemotePackage {
    async fn run(&self, message: &Message, slot: &mut ResponseSlot) -> Result<(), HandlerError> {
        self.call(Invocation::Run, message, slot).await
    }

    async fn follow_up(&self, message: &Message, slot: &mut ResponseSlot) -> Result<(), HandlerError> {
        self.call(Invocation::FollowUp, message, slot).await
    }
}
