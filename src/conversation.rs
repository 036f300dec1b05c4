//! Conversation transcript shown to the farmer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// First assistant message of every conversation.
pub const GREETING: &str = "Hello! I am your Kisan Mitra. I can help you with crop diseases, \
pest control, market prices, and government schemes. You can talk to me using voice or text, \
and I can analyze crop images too!";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversationError {
    #[error("message {0} is already in the conversation")]
    DuplicateId(Uuid),

    #[error("message {0} not found")]
    NotFound(Uuid),

    #[error("message {0} was already replaced once")]
    AlreadyReplaced(Uuid),
}

/// One exchange unit. Author and creation time are fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: Uuid,
    text: String,
    is_from_user: bool,
    created_at: DateTime<Utc>,
    image_ref: Option<PathBuf>,
    audio_ref: Option<PathBuf>,
    is_voice: bool,
    #[serde(default)]
    replaced: bool,
}

impl Message {
    fn new(text: impl Into<String>, is_from_user: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            is_from_user,
            created_at: Utc::now(),
            image_ref: None,
            audio_ref: None,
            is_voice: false,
            replaced: false,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(text, true)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(text, false)
    }

    pub fn with_image(mut self, image: impl Into<PathBuf>) -> Self {
        self.image_ref = Some(image.into());
        self
    }

    pub fn with_audio(mut self, audio: impl Into<PathBuf>) -> Self {
        self.audio_ref = Some(audio.into());
        self
    }

    /// Mark as part of a voice exchange.
    pub fn voice(mut self) -> Self {
        self.is_voice = true;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_from_user(&self) -> bool {
        self.is_from_user
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn image_ref(&self) -> Option<&PathBuf> {
        self.image_ref.as_ref()
    }

    pub fn audio_ref(&self) -> Option<&PathBuf> {
        self.audio_ref.as_ref()
    }

    pub fn is_voice(&self) -> bool {
        self.is_voice
    }

    /// Whether the text can still be replaced.
    pub fn is_replaceable(&self) -> bool {
        !self.replaced
    }
}

/// Ordered transcript of one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SavedConversation")]
pub struct Conversation {
    messages: Vec<Message>,
}

/// Wire shape of a saved conversation, checked before it becomes one.
#[derive(Deserialize)]
struct SavedConversation {
    messages: Vec<Message>,
}

impl TryFrom<SavedConversation> for Conversation {
    type Error = ConversationError;

    fn try_from(saved: SavedConversation) -> Result<Self, Self::Error> {
        let mut conversation = Conversation {
            messages: Vec::with_capacity(saved.messages.len()),
        };
        for message in saved.messages {
            conversation.push(message)?;
        }
        Ok(conversation)
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    /// A conversation holding only the greeting.
    pub fn new() -> Self {
        Self {
            messages: vec![Message::assistant(GREETING)],
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append `message`. Ids must be unique within the conversation.
    pub fn push(&mut self, message: Message) -> Result<&Message, ConversationError> {
        if self.get(message.id).is_some() {
            return Err(ConversationError::DuplicateId(message.id));
        }
        self.messages.push(message);
        let index = self.messages.len() - 1;
        Ok(&self.messages[index])
    }

    pub fn get(&self, id: Uuid) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Replace the text of a message. Allowed once per message, e.g. to swap
    /// a "processing..." placeholder for the final transcript.
    pub fn replace_text(&mut self, id: Uuid, text: impl Into<String>) -> Result<(), ConversationError> {
        let message = self
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(ConversationError::NotFound(id))?;
        if message.replaced {
            return Err(ConversationError::AlreadyReplaced(id));
        }
        message.text = text.into();
        message.replaced = true;
        Ok(())
    }

    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.is_from_user)
    }

    pub fn last_assistant_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| !m.is_from_user)
    }

    pub fn voice_messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.is_voice)
    }

    /// Back to a conversation holding only the greeting.
    pub fn clear(&mut self) {
        self.messages = vec![Message::assistant(GREETING)];
    }
}
