//! HTTP postback messenger.
//!
//! Delivers each message as a JSON POST to a configured endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use url::Url;

use crate::config::PostbackConfig;
use crate::messenger::{Message, Messenger, MessengerError};

#[derive(Serialize)]
struct Payload<'a> {
    messenger: &'a str,
    #[serde(flatten)]
    message: &'a Message,
}

pub struct PostbackMessenger {
    name: String,
    url: Url,
    auth: Option<(String, String)>,
    client: reqwest::Client,
    closed: AtomicBool,
}

impl PostbackMessenger {
    pub fn new(config: &PostbackConfig) -> Result<Self, MessengerError> {
        let url = Url::parse(&config.url).map_err(|e| MessengerError::Invalid {
            name: config.name.clone(),
            reason: format!("bad url: {}", e),
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(MessengerError::Invalid {
                name: config.name.clone(),
                reason: format!("unsupported scheme `{}`", url.scheme()),
            });
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        let auth = (!config.username.is_empty())
            .then(|| (config.username.clone(), config.password.clone()));

        Ok(Self {
            name: config.name.clone(),
            url,
            auth,
            client,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Messenger for PostbackMessenger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &Message) -> Result<(), MessengerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessengerError::Closed(self.name.clone()));
        }

        let mut request = self.client.post(self.url.clone()).json(&Payload {
            messenger: &self.name,
            message,
        });
        if let Some((user, pass)) = &self.auth {
            request = request.basic_auth(user, Some(pass));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MessengerError::Transport(format!(
                "{} responded {}",
                self.url, status
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), MessengerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> PostbackConfig {
        PostbackConfig {
            name: "webhook".into(),
            url: url.into(),
            username: String::new(),
            password: String::new(),
            timeout_secs: 1,
            enabled: true,
        }
    }

    #[test]
    fn test_rejects_non_http_url() {
        assert!(matches!(
            PostbackMessenger::new(&config("ftp://example.com/hook")),
            Err(MessengerError::Invalid { .. })
        ));
        assert!(matches!(
            PostbackMessenger::new(&config("not a url")),
            Err(MessengerError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn test_closed_messenger_refuses_send() {
        let messenger = PostbackMessenger::new(&config("http://127.0.0.1:9/hook")).unwrap();
        messenger.close().await.unwrap();

        let message = Message::new(vec!["a@example.com".into()], "s", "b");
        assert!(matches!(
            messenger.send(&message).await,
            Err(MessengerError::Closed(_))
        ));
    }
}
