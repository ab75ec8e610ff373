//! The interpreter: walks an `Episode` against a `Cursor`, producing an
//! `Outcome`. This is the one place in the crate that understands how each
//! IR node consumes input and propagates failure/cancellation; everything
//! above it (`Scenario`, `Demultiplexer`) only ever builds `Episode` values
//! and reads back `SessionResult`s.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::Stream;

use crate::cursor::{Cursor, StreamCursor};
use crate::episode::{BoxEffect, Episode, ExtractFn, OnCancelFn, PredFn};
use crate::event::Messageable;

/// What evaluating an `Episode` against a cursor produced, together with
/// whatever of the cursor's remaining input was not consumed (so a caller can
/// keep driving the same underlying stream across multiple sessions).
pub(crate) enum Outcome<A, E> {
    Matched(A, Box<dyn Cursor>),
    Mismatched(Messageable, Box<dyn Cursor>),
    Failed(E, Box<dyn Cursor>),
    Cancelled,
    Ended,
}

/// A linked chain of active `Cancellable` scopes, innermost first. Modeled as
/// a reader parameter threaded through `evaluate` rather than a stack
/// maintained on some shared cursor wrapper, so that a nested scope is
/// dropped automatically when the recursive call that pushed it returns --
/// ordinary Rust call-stack scoping does the popping.
pub(crate) type Scope<E> = Option<Arc<ScopeNode<E>>>;

pub(crate) struct ScopeNode<E> {
    pub(crate) pred: PredFn,
    pub(crate) on_cancel: Option<OnCancelFn<E>>,
    pub(crate) parent: Scope<E>,
}

/// Walks `scope` from innermost to outermost looking for a `Cancellable`
/// whose `cancel_when` predicate matches `event`. Returns the matching node,
/// if any.
fn find_cancelling_scope<E>(scope: &Scope<E>, event: &Messageable) -> Scope<E> {
    let mut current = scope.clone();
    while let Some(node) = current {
        if (node.pred)(event) {
            return Some(node);
        }
        current = node.parent.clone();
    }
    None
}

/// Rebuilds `scope` (registered by some enclosing `Cancellable` in terms of
/// its own error type `E2`) into an equivalent `Scope<E1>` usable while
/// evaluating the episode behind a `MapErr` boundary. A cancel predicate
/// carries no error type and copies across unchanged; an `on_cancel` effect
/// is itself still run in its original `E2` terms (the side effect genuinely
/// executes), but a failure it raises cannot be represented as an `E1` value
/// at the point it is discovered, so it is stashed into `escalated` instead.
/// The `MapErr` boundary that called this recovers it once `evaluate`
/// returns and turns it into a proper `Outcome::Failed(e2, ..)`, rather than
/// letting the failure disappear as an indistinguishable `Cancelled`.
pub(crate) fn translate_scope<E1, E2>(
    scope: Scope<E2>,
    escalated: Arc<Mutex<Option<E2>>>,
) -> Scope<E1>
where
    E1: Send + 'static,
    E2: Send + 'static,
{
    scope.map(|node| {
        let on_cancel = node.on_cancel.clone().map(|on_cancel_e2| {
            let escalated = escalated.clone();
            Arc::new(move |event: Messageable| {
                let on_cancel_e2 = on_cancel_e2.clone();
                let escalated = escalated.clone();
                Box::pin(async move {
                    if let Err(e2) = on_cancel_e2(event).await {
                        *escalated.lock().unwrap() = Some(e2);
                    }
                    Ok(())
                }) as BoxEffect<(), E1>
            }) as OnCancelFn<E1>
        });

        Arc::new(ScopeNode {
            pred: node.pred.clone(),
            on_cancel,
            parent: translate_scope(node.parent.clone(), escalated),
        })
    })
}

/// Interprets `episode` against `cursor`, honoring whatever `Cancellable`
/// scopes are currently active.
pub(crate) fn evaluate<A, E>(
    episode: Episode<A, E>,
    cursor: Box<dyn Cursor>,
    scope: Scope<E>,
) -> BoxFuture<'static, Outcome<A, E>>
where
    A: Send + 'static,
    E: Send + 'static,
{
    Box::pin(async move {
        match episode {
            Episode::Pure(a) => Outcome::Matched(a, cursor),
            Episode::RaiseError(e) => Outcome::Failed(e, cursor),
            Episode::Eval(effect) => match effect.await {
                Ok(a) => Outcome::Matched(a, cursor),
                Err(e) => Outcome::Failed(e, cursor),
            },
            Episode::Next(pred, extract) => evaluate_next(pred, extract, cursor, scope).await,
            Episode::Bind(step) => step.step(cursor, scope).await,
            Episode::Map(step) => step.step(cursor, scope).await,
            Episode::MapErr(step) => step.step(cursor, scope).await,
            Episode::Protected(inner, recover) => {
                match evaluate(*inner, cursor, scope.clone()).await {
                    Outcome::Failed(e, rest) => evaluate(recover(e), rest, scope).await,
                    other => other,
                }
            }
            Episode::Tolerate(spec) => evaluate_tolerate(spec, cursor, scope).await,
            Episode::Cancellable(inner, cancel_when, on_cancel) => {
                let nested_scope = Some(Arc::new(ScopeNode {
                    pred: cancel_when,
                    on_cancel,
                    parent: scope,
                }));
                evaluate(*inner, cursor, nested_scope).await
            }
            Episode::TimeLimited(inner, duration) => {
                match tokio::time::timeout(duration, evaluate(*inner, cursor, scope)).await {
                    Ok(outcome) => outcome,
                    // The in-flight effect (if any) is left to complete on its own
                    // task; the session itself treats the elapsed deadline as a
                    // cancellation, since the cursor cannot be recovered once its
                    // owning future has been abandoned.
                    Err(_elapsed) => Outcome::Cancelled,
                }
            }
        }
    })
}

async fn evaluate_next<A, E>(
    pred: PredFn,
    extract: ExtractFn<A>,
    mut cursor: Box<dyn Cursor>,
    scope: Scope<E>,
) -> Outcome<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    let event = match cursor.pull().await {
        Some(event) => event,
        None => return Outcome::Ended,
    };

    if let Some(cancelling) = find_cancelling_scope(&scope, &event) {
        if let Some(on_cancel) = &cancelling.on_cancel {
            // §7: an effect error inside `on_cancel` escalates to UserError
            // rather than being swallowed into a clean `Cancelled` -- the
            // cursor is still ours to hand back here since cancellation
            // hasn't returned yet.
            if let Err(e) = on_cancel(event).await {
                return Outcome::Failed(e, cursor);
            }
        }
        return Outcome::Cancelled;
    }

    if pred(&event) {
        Outcome::Matched(extract(event), cursor)
    } else {
        Outcome::Mismatched(event, cursor)
    }
}

async fn evaluate_tolerate<A, E>(
    spec: crate::episode::ToleranceSpec<A, E>,
    mut cursor: Box<dyn Cursor>,
    scope: Scope<E>,
) -> Outcome<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    let mut attempts: u64 = 0;
    loop {
        let inner = (spec.inner_factory)();
        match evaluate(inner, cursor, scope.clone()).await {
            Outcome::Mismatched(event, rest) => {
                attempts += 1;
                // `onMismatch` reports the offending event whether or not
                // another retry follows -- the limit only decides what
                // happens next, not whether the caller gets to see it.
                let exhausted = spec.limit.is_some_and(|limit| attempts > limit);
                if let Err(e) = (spec.on_mismatch)(event.clone()).await {
                    return Outcome::Failed(e, rest);
                }
                if exhausted {
                    return Outcome::Mismatched(event, rest);
                }
                cursor = rest;
            }
            other => return other,
        }
    }
}

/// The terminal result of running a scenario's episode to completion against
/// a single session's input. `Mismatched` only ever escapes an unprotected
/// top-level episode (nothing caught it with `tolerate`); it is mostly useful
/// for tests and diagnostics.
#[derive(Debug)]
pub enum SessionResult<A, E> {
    Matched(A),
    Failed(E),
    Cancelled,
    Mismatched(Messageable),
    UpstreamTerminated,
}

impl<A, E> From<Outcome<A, E>> for SessionResult<A, E> {
    fn from(outcome: Outcome<A, E>) -> Self {
        match outcome {
            Outcome::Matched(a, _) => SessionResult::Matched(a),
            Outcome::Mismatched(ev, _) => SessionResult::Mismatched(ev),
            Outcome::Failed(e, _) => SessionResult::Failed(e),
            Outcome::Cancelled => SessionResult::Cancelled,
            Outcome::Ended => SessionResult::UpstreamTerminated,
        }
    }
}

/// Runs `episode` to completion against `stream`, consuming whatever prefix
/// of it the episode needed and discarding the rest.
pub async fn run<A, E>(
    episode: Episode<A, E>,
    stream: impl Stream<Item = Messageable> + Send + 'static,
) -> SessionResult<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    let cursor: Box<dyn Cursor> = Box::new(StreamCursor::new(stream));
    evaluate(episode, cursor, None).await.into()
}

/// Repeatedly builds a fresh episode from `build` and evaluates it against
/// the same underlying stream, yielding one `SessionResult` per completed
/// session, until the upstream source ends or a session fails/cancels.
///
/// This is the general-purpose "restart on completion" capability; the
/// demultiplexer instead runs each per-conversation session to exactly one
/// completion and tears down its actor, relying on a fresh conversation event
/// to spin up a new one later.
pub fn drive<A, E>(
    build: Arc<dyn Fn() -> Episode<A, E> + Send + Sync>,
    stream: impl Stream<Item = Messageable> + Send + 'static,
) -> impl Stream<Item = SessionResult<A, E>>
where
    A: Send + 'static,
    E: Send + 'static,
{
    async_stream::stream! {
        let mut cursor: Box<dyn Cursor> = Box::new(StreamCursor::new(stream));
        loop {
            match evaluate(build(), cursor, None).await {
                Outcome::Matched(a, rest) => {
                    cursor = rest;
                    yield SessionResult::Matched(a);
                }
                Outcome::Mismatched(ev, rest) => {
                    cursor = rest;
                    yield SessionResult::Mismatched(ev);
                }
                Outcome::Failed(e, _) => {
                    yield SessionResult::Failed(e);
                    break;
                }
                Outcome::Cancelled => {
                    yield SessionResult::Cancelled;
                    break;
                }
                Outcome::Ended => {
                    yield SessionResult::UpstreamTerminated;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::stream;

    use super::*;
    use crate::episode::{BindNode, MapErrNode, ToleranceSpec};
    use crate::event::{IncomingMessage, Messageable};

    fn msg(text: &str) -> Messageable {
        Messageable::IncomingMessage(IncomingMessage {
            message_id: 1,
            conversation_id: 1,
            sender_id: 1,
            text: Some(text.to_string()),
            document_file_id: None,
            sent_at: 0,
        })
    }

    fn next_text(expected: &'static str) -> Episode<(), String> {
        Episode::Next(
            Arc::new(move |e: &Messageable| e.text() == Some(expected)),
            Arc::new(|_| ()),
        )
    }

    /// §4.2's precise rule: once `prev` in a `Bind` has consumed at least
    /// one event, a mismatch from the continuation is *not* silently
    /// retried on its own -- it escalates to the nearest enclosing
    /// `Tolerate`, which is the one that decides whether to retry.
    #[tokio::test]
    async fn mismatch_after_partial_consumption_escalates_to_tolerate() {
        let build = || -> Episode<(), String> {
            Episode::Bind(Box::new(BindNode {
                prev: next_text("a"),
                k: |_: ()| next_text("b"),
            }))
        };

        let episode = Episode::Tolerate(ToleranceSpec {
            inner_factory: Arc::new(build),
            limit: Some(2),
            on_mismatch: Arc::new(|_ev| Box::pin(async { Ok(()) })),
        });

        // First attempt: "a" is consumed (prev matches), then "x" mismatches
        // the continuation's Next("b") -- this must surface to Tolerate
        // rather than vanish. Tolerate retries from "a" again, consuming
        // "a" then "b" to completion.
        let events = stream::iter(vec![msg("a"), msg("x"), msg("a"), msg("b")]);
        let cursor: Box<dyn Cursor> = Box::new(StreamCursor::new(events));

        let outcome = evaluate(episode, cursor, None).await;
        assert!(matches!(outcome, Outcome::Matched((), _)));
    }

    /// `tolerate_n`'s bound: after the limit is exhausted, the mismatch
    /// propagates instead of retrying again.
    #[tokio::test]
    async fn tolerate_gives_up_after_limit_exhausted() {
        let episode = Episode::Tolerate(ToleranceSpec {
            inner_factory: Arc::new(|| next_text("a")),
            limit: Some(1),
            on_mismatch: Arc::new(|_ev| Box::pin(async { Ok(()) })),
        });

        let events = stream::iter(vec![msg("x"), msg("y")]);
        let cursor: Box<dyn Cursor> = Box::new(StreamCursor::new(events));

        let outcome = evaluate(episode, cursor, None).await;
        assert!(matches!(outcome, Outcome::Mismatched(ev, _) if ev.text() == Some("y")));
    }

    /// Tie-break: a `Cancellable` predicate that matches takes the event
    /// before the wrapped `Next` ever sees it, even if `Next`'s own
    /// predicate would also have matched.
    #[tokio::test]
    async fn cancellable_consumes_event_before_inner_next_sees_it() {
        let inner: Episode<Messageable, String> =
            Episode::Next(Arc::new(|_: &Messageable| true), Arc::new(|m| m));
        let episode = Episode::Cancellable(
            Box::new(inner),
            Arc::new(|e: &Messageable| e.text() == Some("/cancel")),
            None,
        );

        let events = stream::iter(vec![msg("/cancel")]);
        let cursor: Box<dyn Cursor> = Box::new(StreamCursor::new(events));

        let outcome = evaluate(episode, cursor, None).await;
        assert!(matches!(outcome, Outcome::Cancelled));
    }

    /// A `TimeLimited` episode is cancelled once its deadline elapses, even
    /// though the underlying stream never produces an event.
    #[tokio::test(start_paused = true)]
    async fn time_limited_cancels_when_deadline_elapses() {
        let inner: Episode<Messageable, String> =
            Episode::Next(Arc::new(|_: &Messageable| true), Arc::new(|m| m));
        let episode = Episode::TimeLimited(Box::new(inner), Duration::from_millis(100));

        let cursor: Box<dyn Cursor> = Box::new(StreamCursor::new(stream::pending::<Messageable>()));
        let handle = tokio::spawn(evaluate(episode, cursor, None));

        tokio::time::advance(Duration::from_millis(150)).await;

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, Outcome::Cancelled));
    }

    /// `run` against an exhausted stream ends quietly rather than hanging
    /// or failing.
    #[tokio::test]
    async fn run_reports_upstream_terminated_on_empty_stream() {
        let episode: Episode<(), String> = next_text("a");
        let result = run(episode, stream::empty()).await;
        assert!(matches!(result, SessionResult::UpstreamTerminated));
    }

    /// §7: a failing `on_cancel` effect escalates to `Failed` rather than
    /// being swallowed into an indistinguishable `Cancelled`, matching how
    /// `evaluate_tolerate` already treats a failing `on_mismatch`.
    #[tokio::test]
    async fn on_cancel_failure_escalates_to_failed() {
        let inner: Episode<Messageable, String> =
            Episode::Next(Arc::new(|_: &Messageable| true), Arc::new(|m| m));
        let episode = Episode::Cancellable(
            Box::new(inner),
            Arc::new(|e: &Messageable| e.text() == Some("/cancel")),
            Some(Arc::new(|_event: Messageable| {
                Box::pin(async { Err("on_cancel blew up".to_string()) })
            })),
        );

        let events = stream::iter(vec![msg("/cancel")]);
        let cursor: Box<dyn Cursor> = Box::new(StreamCursor::new(events));

        let outcome = evaluate(episode, cursor, None).await;
        assert!(matches!(outcome, Outcome::Failed(e, _) if e == "on_cancel blew up"));
    }

    /// §3 / review fix: an enclosing `Cancellable`'s scope now reaches across
    /// a `map_err` boundary instead of being dropped at it -- the predicate
    /// still cancels the inner episode even though the inner episode's own
    /// error type differs from the outer scope's.
    #[tokio::test]
    async fn cancellable_scope_crosses_map_err_boundary() {
        let inner: Episode<Messageable, i64> =
            Episode::Next(Arc::new(|_: &Messageable| true), Arc::new(|m| m));
        let map_err_step = MapErrNode {
            inner,
            f: |e: i64| e.to_string(),
        };
        let map_err_episode: Episode<Messageable, String> =
            Episode::MapErr(Box::new(map_err_step));

        let episode = Episode::Cancellable(
            Box::new(map_err_episode),
            Arc::new(|e: &Messageable| e.text() == Some("/cancel")),
            None,
        );

        let events = stream::iter(vec![msg("/cancel")]);
        let cursor: Box<dyn Cursor> = Box::new(StreamCursor::new(events));

        let outcome = evaluate(episode, cursor, None).await;
        assert!(matches!(outcome, Outcome::Cancelled));
    }

    /// The one narrow gap `map_err` leaves: an `on_cancel` effect that fails
    /// on the *outer* (`E2`) side, while the wrapped episode is still being
    /// evaluated in its own (`E1`) terms, surfaces as `Failed` once
    /// cancellation unwinds back across the boundary, carrying the outer
    /// error rather than disappearing as a plain `Cancelled`.
    #[tokio::test]
    async fn map_err_boundary_escalates_failing_on_cancel_from_outer_scope() {
        let inner: Episode<Messageable, i64> =
            Episode::Next(Arc::new(|_: &Messageable| true), Arc::new(|m| m));
        let map_err_step = MapErrNode {
            inner,
            f: |e: i64| e.to_string(),
        };
        let map_err_episode: Episode<Messageable, String> =
            Episode::MapErr(Box::new(map_err_step));

        let episode = Episode::Cancellable(
            Box::new(map_err_episode),
            Arc::new(|e: &Messageable| e.text() == Some("/cancel")),
            Some(Arc::new(|_event: Messageable| {
                Box::pin(async { Err("outer on_cancel blew up".to_string()) })
            })),
        );

        let events = stream::iter(vec![msg("/cancel")]);
        let cursor: Box<dyn Cursor> = Box::new(StreamCursor::new(events));

        let outcome = evaluate(episode, cursor, None).await;
        assert!(matches!(outcome, Outcome::Failed(e, _) if e == "outer on_cancel blew up"));
    }
}
