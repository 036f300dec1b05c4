//! Connectivity-aware delivery of typed chat messages
//!
//! Online, a message goes to the chat endpoint over HTTP and the reply is
//! appended to the conversation. Offline, the router hands the message to
//! the platform SMS composer addressed to the support number. Either way
//! every accepted message ends in exactly one assistant reply, so the
//! transcript records what happened.

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::multipart::Form;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::conversation::{Conversation, ConversationError, Message};

/// Characters left alone by JavaScript's `encodeURIComponent`.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

pub const DEFAULT_SUPPORT_PHONE: &str = "18001801551";
pub const DEFAULT_SENDER_ID: &str = "whatsapp:+910000000000";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Non-2xx reply. `reason` is the standard phrase for `code` (empty for
    /// codes without one), not the text on the server's status line, which
    /// the HTTP client does not keep.
    #[error("{code} {reason}")]
    Status { code: u16, reason: String },

    #[error("{0}")]
    Network(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("could not open {uri}: {reason}")]
pub struct OpenLinkError {
    pub uri: String,
    pub reason: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("message is empty")]
    EmptyMessage,

    #[error(transparent)]
    Conversation(#[from] ConversationError),
}

/// Online delivery path. Returns the assistant's reply text.
#[async_trait]
pub trait ChatChannel: Send + Sync {
    async fn deliver(&self, text: &str) -> Result<String, ChannelError>;
}

/// Launches platform deep links.
#[async_trait]
pub trait DeepLinkOpener: Send + Sync {
    async fn can_open(&self, uri: &str) -> bool;
    async fn open(&self, uri: &str) -> Result<(), OpenLinkError>;
}

/// Multipart form POST to the chat webhook.
pub struct HttpChatChannel {
    client: reqwest::Client,
    endpoint: String,
    sender_id: String,
}

impl HttpChatChannel {
    pub fn new(endpoint: impl Into<String>, sender_id: impl Into<String>) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ChannelError::Network(e.to_string()))?;
        Ok(Self::with_client(client, endpoint, sender_id))
    }

    pub fn with_client(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        sender_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            sender_id: sender_id.into(),
        }
    }
}

#[async_trait]
impl ChatChannel for HttpChatChannel {
    async fn deliver(&self, text: &str) -> Result<String, ChannelError> {
        let form = Form::new()
            .text("From", self.sender_id.clone())
            .text("Body", text.to_string());

        debug!("Posting chat message to {}", self.endpoint);
        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ChannelError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChannelError::Status {
                code: status.as_u16(),
                reason: status.canonical_reason().unwrap_or_default().to_string(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| ChannelError::Network(e.to_string()))?;
        Ok(extract_reply(&body))
    }
}

/// Text between the first `<Message>` and `</Message>`, or the whole body.
pub fn extract_reply(body: &str) -> String {
    const OPEN: &str = "<Message>";
    const CLOSE: &str = "</Message>";

    body.find(OPEN)
        .map(|start| start + OPEN.len())
        .and_then(|start| {
            body[start..]
                .find(CLOSE)
                .map(|len| body[start..start + len].trim().to_string())
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// Opens links by handing them to a launcher program such as `xdg-open`.
pub struct CommandLinkOpener {
    program: PathBuf,
}

impl Default for CommandLinkOpener {
    fn default() -> Self {
        Self::new("xdg-open")
    }
}

impl CommandLinkOpener {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn program_available(&self) -> bool {
        if self.program.components().count() > 1 {
            return self.program.is_file();
        }
        std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(&self.program).is_file()))
            .unwrap_or(false)
    }
}

#[async_trait]
impl DeepLinkOpener for CommandLinkOpener {
    async fn can_open(&self, uri: &str) -> bool {
        uri.starts_with("sms:") && self.program_available()
    }

    async fn open(&self, uri: &str) -> Result<(), OpenLinkError> {
        let status = tokio::process::Command::new(&self.program)
            .arg(uri)
            .status()
            .await
            .map_err(|e| OpenLinkError {
                uri: uri.to_string(),
                reason: e.to_string(),
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(OpenLinkError {
                uri: uri.to_string(),
                reason: format!("{:?} exited with {}", self.program, status),
            })
        }
    }
}

/// Separator between the phone number and the `body` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmsLinkStyle {
    /// `sms:<phone>?body=...`
    #[default]
    Query,
    /// `sms:<phone>&body=...`, needed by some platforms.
    Ampersand,
}

impl FromStr for SmsLinkStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "query" | "?" => Ok(Self::Query),
            "ampersand" | "&" => Ok(Self::Ampersand),
            other => Err(format!("unknown SMS link style `{}`", other)),
        }
    }
}

/// Build an SMS composer link. Without a body the link only opens the composer.
pub fn sms_uri(phone: &str, body: Option<&str>, style: SmsLinkStyle) -> String {
    match body {
        None => format!("sms:{}", phone),
        Some(body) => {
            let separator = match style {
                SmsLinkStyle::Query => '?',
                SmsLinkStyle::Ampersand => '&',
            };
            format!(
                "sms:{}{}body={}",
                phone,
                separator,
                utf8_percent_encode(body, URI_COMPONENT)
            )
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub support_phone: String,
    pub sms_style: SmsLinkStyle,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            support_phone: DEFAULT_SUPPORT_PHONE.to_string(),
            sms_style: SmsLinkStyle::default(),
        }
    }
}

pub struct MessageRouter {
    channel: Arc<dyn ChatChannel>,
    opener: Arc<dyn DeepLinkOpener>,
    config: RouterConfig,
}

impl MessageRouter {
    pub fn new(
        channel: Arc<dyn ChatChannel>,
        opener: Arc<dyn DeepLinkOpener>,
        config: RouterConfig,
    ) -> Self {
        Self {
            channel,
            opener,
            config,
        }
    }

    /// Deliver one user message and append the outcome to `conversation`.
    ///
    /// Appends the user's message followed by exactly one assistant message,
    /// which is also returned. Blank input is rejected and appends nothing.
    pub async fn route(
        &self,
        conversation: &mut Conversation,
        text: &str,
        is_online: bool,
    ) -> Result<Message, RouterError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RouterError::EmptyMessage);
        }
        conversation.push(Message::user(text))?;

        let reply = if is_online {
            self.deliver_online(text).await
        } else {
            self.deliver_sms(text).await
        };

        let reply = conversation.push(Message::assistant(reply))?;
        Ok(reply.clone())
    }

    async fn deliver_online(&self, text: &str) -> String {
        match self.channel.deliver(text).await {
            Ok(reply) => {
                info!("Chat reply received ({} chars)", reply.len());
                reply
            }
            Err(ChannelError::Status { code, reason }) => {
                error!("Chat endpoint returned {} {}", code, reason);
                format!("Sorry, the server returned an error: {} {}", code, reason)
                    .trim_end()
                    .to_string()
            }
            Err(ChannelError::Network(e)) => {
                error!("Chat request failed: {}", e);
                format!(
                    "Sorry, I could not reach the server ({}). Please check your connection and try again.",
                    e
                )
            }
        }
    }

    async fn deliver_sms(&self, text: &str) -> String {
        let phone = &self.config.support_phone;
        let uri = sms_uri(phone, Some(text), self.config.sms_style);

        if self.opener.can_open(&uri).await {
            match self.opener.open(&uri).await {
                Ok(()) => {
                    info!("Opened SMS composer for {}", phone);
                    return format!(
                        "You are offline, so I opened your SMS app to send your message to our support number {}. You will get a reply by SMS.",
                        phone
                    );
                }
                Err(e) => warn!("Pre-filled SMS link failed: {}", e),
            }
        } else {
            debug!("SMS link with body not supported, trying bare composer");
        }

        match self.opener.open(&sms_uri(phone, None, self.config.sms_style)).await {
            Ok(()) => format!(
                "You are offline. I opened your SMS app for {}. Please type this message there and send it: \"{}\"",
                phone, text
            ),
            Err(e) => {
                error!("Could not open SMS composer: {}", e);
                format!(
                    "You are offline and I could not open your SMS app. Please send an SMS to {} with your question.",
                    phone
                )
            }
        }
    }
}
