//! Onboard package - points new users at the signup page.

use async_trait::async_trait;
use std::sync::Arc;
use url::form_urlencoded;

use crate::message::{Message, Trigger};
use crate::package::{HandlerError, Package, PackageError, PackageRuntime, ResponseSlot};

/// Replies to "onboard" with a signup link for the conversation's identity
#[derive(Debug, Clone)]
pub struct Onboard {
    base_url: String,
}

impl Onboard {
    pub const NAME: &'static str = "onboard";

    /// `base_url` must end with `/`; one is added otherwise
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self { base_url }
    }

    pub fn trigger() -> Trigger {
        Trigger::new([Self::NAME])
    }

    /// Full signup link for the sender; not shortened
    pub fn signup_url(&self, message: &Message) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("flexid", &message.flex_id)
            .append_pair("flexidtype", &message.flex_id_type.to_string())
            .finish();
        format!("{}signup?{}", self.base_url, query)
    }

    fn greet(&self, message: &Message, slot: &mut ResponseSlot) -> Result<(), HandlerError> {
        let sentence = format!(
            "Hi, I'm Abot. To get started, you can sign up here: {}",
            self.signup_url(message)
        );
        slot.save(message.new_response().with_sentence(sentence))
    }

    /// Run as its own process: listen on `port`, register with the router
    pub async fn serve(self, port: u16, router_url: &str) -> Result<(), PackageError> {
        let package = Package::new(Self::NAME, port, Self::trigger(), router_url);
        package.serve(Arc::new(self)).await
    }
}

#[async_trait]
impl PackageRuntime for Onboard {
    async fn run(&self, message: &Message, slot: &mut ResponseSlot) -> Result<(), HandlerError> {
        self.greet(message, slot)
    }

    async fn follow_up(&self, message: &Message, slot: &mut ResponseSlot) -> Result<(), HandlerError> {
        self.greet(message, slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::FlexIdType;
    use crate::package::{invoke, Invocation};

    #[test]
    fn test_signup_url_encodes_identity() {
        let onboard = Onboard::new("https://abot.example.com");
        let message = Message::new(FlexIdType::Phone, "+15555550100", "onboard");
        assert_eq!(
            onboard.signup_url(&message),
            "https://abot.example.com/signup?flexid=%2B15555550100&flexidtype=2"
        );

        let message = Message::new(FlexIdType::Email, "new.user@example.org", "onboard");
        assert_eq!(
            onboard.signup_url(&message),
            "https://abot.example.com/signup?flexid=new.user%40example.org&flexidtype=1"
        );
    }

    #[tokio::test]
    async fn test_run_and_follow_up_agree() {
        let onboard = Onboard::new("http://localhost:4200/");
        let message = Message::new(FlexIdType::Phone, "+15555550100", "onboard me");

        let run = invoke(&onboard, Invocation::Run, &message)
            .await
            .unwrap()
            .into_response()
            .unwrap();
        let follow_up = invoke(&onboard, Invocation::FollowUp, &message)
            .await
            .unwrap()
            .into_response()
            .unwrap();

        assert_eq!(
            run.sentence,
            "Hi, I'm Abot. To get started, you can sign up here: \
             http://localhost:4200/signup?flexid=%2B15555550100&flexidtype=2"
        );
        assert_eq!(run, follow_up);
        assert!(!run.follow_up);
    }

    #[test]
    fn test_trigger() {
        assert_eq!(Onboard::trigger().commands(), vec!["onboard".to_string()]);
    }
}
