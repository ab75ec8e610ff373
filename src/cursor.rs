use std::pin::Pin;

use futures::future::BoxFuture;
use futures::Stream;
use futures::StreamExt;

use crate::event::Messageable;

/// A single-consumer handle onto the remaining input of a matching session.
///
/// `Next` pulls through this trait rather than holding a `Stream` directly so
/// that combinators which need to observe every event passing through a
/// sub-episode (none currently; cancellation is implemented via a reader-style
/// scope instead, see `matcher::Scope`) have a seam to do so without the
/// matcher itself needing to know about them.
pub(crate) trait Cursor: Send {
    fn pull(&mut self) -> BoxFuture<'_, Option<Messageable>>;
}

/// The base cursor: a boxed stream of already-decoded events, as handed to a
/// matching session by the demultiplexer (or directly by the caller at the
/// top level).
pub(crate) struct StreamCursor {
    inner: Pin<Box<dyn Stream<Item = Messageable> + Send>>,
}

impl StreamCursor {
    pub(crate) fn new(stream: impl Stream<Item = Messageable> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
        }
    }
}

impl Cursor for StreamCursor {
    fn pull(&mut self) -> BoxFuture<'_, Option<Messageable>> {
        Box::pin(self.inner.next())
    }
}
