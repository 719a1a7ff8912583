//! Message types exchanged between the router and packages.
//!
//! A [`Message`] is one inbound utterance tied to a conversation identity
//! (`flex_id` + [`FlexIdType`]). A package answers it with a [`Response`].
//! Packages claim commands through a [`Trigger`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Channel type of a conversation identity. Encoded as an integer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FlexIdType {
    Email,
    Phone,
}

impl FlexIdType {
    pub fn code(self) -> u8 {
        match self {
            Self::Email => 1,
            Self::Phone => 2,
        }
    }
}

impl TryFrom<u8> for FlexIdType {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::Email),
            2 => Ok(Self::Phone),
            _ => Err(format!("Unknown flexidtype {}. Must be 1 (email) or 2 (phone)", code)),
        }
    }
}

impl From<FlexIdType> for u8 {
    fn from(kind: FlexIdType) -> Self {
        kind.code()
    }
}

impl fmt::Display for FlexIdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Annotations derived from the raw input
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredInput {
    /// Lowercased word tokens, in input order
    #[serde(default)]
    pub commands: Vec<String>,
    /// Reserved for annotators that extract objects
    #[serde(default)]
    pub objects: Vec<String>,
}

impl StructuredInput {
    /// Tokenize a sentence into lowercase alphanumeric commands
    pub fn from_sentence(sentence: &str) -> Self {
        let commands = tokenize(sentence).collect();
        Self {
            commands,
            objects: Vec::new(),
        }
    }
}

/// Lowercased alphanumeric runs of `sentence`
pub fn tokenize(sentence: &str) -> impl Iterator<Item = String> + '_ {
    sentence
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

/// One inbound utterance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub flex_id: String,
    pub flex_id_type: FlexIdType,
    pub raw_input: String,
    #[serde(default)]
    pub structured: StructuredInput,
}

impl Message {
    pub fn new(flex_id_type: FlexIdType, flex_id: impl Into<String>, raw_input: impl Into<String>) -> Self {
        let raw_input = raw_input.into();
        Self {
            flex_id: flex_id.into(),
            flex_id_type,
            structured: StructuredInput::from_sentence(&raw_input),
            raw_input,
        }
    }

    /// Key identifying the conversation this message belongs to
    pub fn conversation(&self) -> ConversationKey {
        ConversationKey {
            flex_id_type: self.flex_id_type,
            flex_id: self.flex_id.clone(),
        }
    }

    /// Start an empty response to this message
    pub fn new_response(&self) -> Response {
        Response::default()
    }
}

/// Conversation identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationKey {
    pub flex_id_type: FlexIdType,
    pub flex_id: String,
}

/// A package's answer to a message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub sentence: String,
    /// Opaque package state
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub state: Map<String, Value>,
    /// Route the next message of this conversation to the same package
    #[serde(default)]
    pub follow_up: bool,
}

impl Response {
    pub fn with_sentence(mut self, sentence: impl Into<String>) -> Self {
        self.sentence = sentence.into();
        self
    }

    pub fn with_state(mut self, key: impl Into<String>, value: Value) -> Self {
        self.state.insert(key.into(), value);
        self
    }

    pub fn expecting_follow_up(mut self) -> Self {
        self.follow_up = true;
        self
    }
}

/// Ordered set of command keywords a package claims
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Trigger {
    commands: Vec<String>,
}

impl Trigger {
    /// Build a trigger, lowercasing keywords and dropping blanks and duplicates
    pub fn new<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = Vec::new();
        for command in commands {
            let command = command.as_ref().trim().to_lowercase();
            if !command.is_empty() && !normalized.contains(&command) {
                normalized.push(command);
            }
        }
        Self {
            commands: normalized,
        }
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// First keyword that no tokenized input can contain, e.g. `check-in`
    pub fn unmatchable(&self) -> Option<&str> {
        self.commands
            .iter()
            .find(|keyword| {
                let mut tokens = tokenize(keyword);
                tokens.next().as_deref() != Some(keyword.as_str()) || tokens.next().is_some()
            })
            .map(String::as_str)
    }
}

impl From<Vec<String>> for Trigger {
    fn from(commands: Vec<String>) -> Self {
        Self::new(commands)
    }
}

impl From<Trigger> for Vec<String> {
    fn from(trigger: Trigger) -> Self {
        trigger.commands
    }
}
