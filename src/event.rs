use serde::{Deserialize, Serialize};

/// Identifies the conversation (chat) an event belongs to. The demultiplexer
/// keys its per-participant fan-out on this.
pub type ConversationId = i64;

/// Identifies the user who sent or triggered an event.
pub type UserId = i64;

pub type MessageId = i64;

/// An incoming text or document message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub text: Option<String>,
    pub document_file_id: Option<String>,
    /// Unix epoch milliseconds.
    pub sent_at: i64,
}

/// A callback button press, referencing the message it was attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    /// The message the callback's keyboard was attached to, if still known.
    pub message_id: Option<MessageId>,
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineQuery {
    pub id: String,
    pub sender_id: UserId,
    pub query: String,
}

/// The full set of event shapes the platform can deliver. Decoding raw
/// platform payloads into this variant is an external collaborator's
/// responsibility (see crate docs); the core only consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Update {
    Message(IncomingMessage),
    EditedMessage(IncomingMessage),
    CallbackQuery(CallbackQuery),
    InlineQuery(InlineQuery),
}

impl Update {
    /// The conversation this update belongs to, if it has one. Inline queries
    /// are not addressed to a conversation and so have none.
    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            Update::Message(m) | Update::EditedMessage(m) => Some(m.conversation_id),
            Update::CallbackQuery(c) => Some(c.conversation_id),
            Update::InlineQuery(_) => None,
        }
    }
}

/// The matcher's input alphabet: incoming messages and callback presses,
/// unified into one type so that `Episode::Next` predicates can be written
/// generically over "the next thing the participant did."
///
/// Edited messages and inline queries are part of the wider event model (see
/// `Update`) but are intentionally excluded here; `pipes::to_messageable`
/// performs the narrowing projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Messageable {
    IncomingMessage(IncomingMessage),
    CallbackQuery(CallbackQuery),
}

impl Messageable {
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            Messageable::IncomingMessage(m) => m.conversation_id,
            Messageable::CallbackQuery(c) => c.conversation_id,
        }
    }

    pub fn sender_id(&self) -> UserId {
        match self {
            Messageable::IncomingMessage(m) => m.sender_id,
            Messageable::CallbackQuery(c) => c.sender_id,
        }
    }

    /// The message text, if this is a text message. Callback queries have no
    /// text of their own.
    pub fn text(&self) -> Option<&str> {
        match self {
            Messageable::IncomingMessage(m) => m.text.as_deref(),
            Messageable::CallbackQuery(_) => None,
        }
    }

    pub fn as_incoming_message(&self) -> Option<&IncomingMessage> {
        match self {
            Messageable::IncomingMessage(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_callback_query(&self) -> Option<&CallbackQuery> {
        match self {
            Messageable::CallbackQuery(c) => Some(c),
            _ => None,
        }
    }
}
