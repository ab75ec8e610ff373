//! Pure, stateless projections from the raw platform update variant to
//! narrower event streams, and predicate/selector combinators used to build
//! `Scenario::expect(...)` calls.

use crate::event::{CallbackQuery, IncomingMessage, MessageId, Messageable, Update};

/// Narrows a raw `Update` to the matcher's input alphabet. Edited messages
/// and inline queries are dropped; everything else the matcher interprets
/// arrives through this projection.
pub fn to_messageable(update: Update) -> Option<Messageable> {
    match update {
        Update::Message(m) => Some(Messageable::IncomingMessage(m)),
        Update::CallbackQuery(c) => Some(Messageable::CallbackQuery(c)),
        Update::EditedMessage(_) | Update::InlineQuery(_) => None,
    }
}

/// Projects only edited messages out of the wider update stream. Outside the
/// `Messageable` alphabet, so it cannot be passed to `Scenario::expect`
/// directly, but is useful for pipelines that react to edits separately from
/// the scenario engine.
pub fn edited_message(update: &Update) -> Option<&IncomingMessage> {
    match update {
        Update::EditedMessage(m) => Some(m),
        _ => None,
    }
}

/// Projects only inline queries whose query text satisfies `predicate`.
pub fn inline_query<'a>(
    update: &'a Update,
    predicate: impl Fn(&str) -> bool,
) -> Option<&'a Update> {
    match update {
        Update::InlineQuery(q) if predicate(&q.query) => Some(update),
        _ => None,
    }
}

/// Matches any incoming text message, regardless of content.
pub fn text_message(event: &Messageable) -> bool {
    matches!(event, Messageable::IncomingMessage(m) if m.text.is_some())
}

/// Matches any incoming message carrying a document attachment.
pub fn document_message(event: &Messageable) -> bool {
    matches!(event, Messageable::IncomingMessage(m) if m.document_file_id.is_some())
}

/// Matches a text message whose text is exactly the given command, e.g.
/// `command("start")` matches the literal text `/start`.
pub fn command(name: &str) -> impl Fn(&Messageable) -> bool + Send + Sync + Clone + 'static {
    let expected = format!("/{name}");
    move |event: &Messageable| event.text() == Some(expected.as_str())
}

/// Matches a text message whose text contains the given substring.
pub fn containing(needle: &str) -> impl Fn(&Messageable) -> bool + Send + Sync + Clone + 'static {
    let needle = needle.to_string();
    move |event: &Messageable| event.text().is_some_and(|text| text.contains(needle.as_str()))
}

/// Matches a callback query, optionally restricted to one originating from a
/// specific message.
pub fn callback(
    associated_message_id: Option<MessageId>,
) -> impl Fn(&Messageable) -> bool + Send + Sync + Clone + 'static {
    move |event: &Messageable| match event.as_callback_query() {
        Some(CallbackQuery { message_id, .. }) => match associated_message_id {
            Some(expected) => *message_id == Some(expected),
            None => true,
        },
        None => false,
    }
}
