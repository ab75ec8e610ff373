//! The Episode intermediate representation: a closed set of constructors for
//! the state-machine primitives the matcher interprets. Episodes are
//! single-use values, destructively consumed by `matcher::evaluate`; the
//! public, re-runnable unit is `Scenario`, which rebuilds a fresh `Episode`
//! each time a matching session (or a `Tolerate` retry) needs one.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::cursor::Cursor;
use crate::matcher::{evaluate, Outcome, Scope};
use crate::event::Messageable;

pub(crate) type PredFn = Arc<dyn Fn(&Messageable) -> bool + Send + Sync>;
pub(crate) type BoxEffect<A, E> = BoxFuture<'static, Result<A, E>>;
pub(crate) type OnMismatchFn<E> = Arc<dyn Fn(Messageable) -> BoxEffect<(), E> + Send + Sync>;
pub(crate) type OnCancelFn<E> = Arc<dyn Fn(Messageable) -> BoxEffect<(), E> + Send + Sync>;
pub(crate) type RecoverFn<A, E> = Arc<dyn Fn(E) -> Episode<A, E> + Send + Sync>;
/// `Next` carries its own `Messageable -> A` extractor rather than fixing
/// `A = Messageable` structurally, so that `evaluate`'s single generic
/// implementation type-checks uniformly for every `Episode<A, E>`
/// instantiation. `Scenario::expect` is the only constructor, and always
/// supplies the identity function.
pub(crate) type ExtractFn<A> = Arc<dyn Fn(Messageable) -> A + Send + Sync>;

/// The closed Episode variant set (§3). `A` is the value a successful match
/// yields; `E` is the error type an `Eval` effect or `raise_error` may raise.
pub(crate) enum Episode<A, E> {
    Pure(A),
    Eval(BoxEffect<A, E>),
    RaiseError(E),
    Next(PredFn, ExtractFn<A>),
    Bind(Box<dyn BindStep<A, E>>),
    Map(Box<dyn MapStep<A, E>>),
    Protected(Box<Episode<A, E>>, RecoverFn<A, E>),
    Tolerate(ToleranceSpec<A, E>),
    MapErr(Box<dyn MapErrStep<A, E>>),
    /// `cancel_when`, plus an optional effect to run at the moment of
    /// cancellation.
    Cancellable(Box<Episode<A, E>>, PredFn, Option<OnCancelFn<E>>),
    TimeLimited(Box<Episode<A, E>>, Duration),
}

/// A `Tolerate` node's retryable state: since retrying means re-running
/// `inner` from scratch, it is stored as a factory rather than a single
/// `Episode`, exactly like `Scenario::build`.
pub(crate) struct ToleranceSpec<A, E> {
    pub(crate) inner_factory: Arc<dyn Fn() -> Episode<A, E> + Send + Sync>,
    pub(crate) limit: Option<u64>,
    pub(crate) on_mismatch: OnMismatchFn<E>,
}

/// Type-erased continuation for `Bind(prev, k)`. `X`, the value `prev`
/// produces, does not appear in `Episode<A, E>`'s own parameter list, so the
/// `prev`/`k` pair is boxed behind this trait rather than stored as an IR
/// variant directly (the same technique `MapStep` uses for `Map`).
pub(crate) trait BindStep<A, E>: Send {
    fn step(
        self: Box<Self>,
        cursor: Box<dyn Cursor>,
        scope: Scope<E>,
    ) -> BoxFuture<'static, Outcome<A, E>>;
}

pub(crate) struct BindNode<X, A, E, K> {
    pub(crate) prev: Episode<X, E>,
    pub(crate) k: K,
}

impl<X, A, E, K> BindStep<A, E> for BindNode<X, A, E, K>
where
    X: Send + 'static,
    A: Send + 'static,
    E: Send + 'static,
    K: FnOnce(X) -> Episode<A, E> + Send + 'static,
{
    fn step(
        self: Box<Self>,
        cursor: Box<dyn Cursor>,
        scope: Scope<E>,
    ) -> BoxFuture<'static, Outcome<A, E>> {
        Box::pin(async move {
            match evaluate(self.prev, cursor, scope.clone()).await {
                Outcome::Matched(x, rest) => evaluate((self.k)(x), rest, scope).await,
                Outcome::Mismatched(ev, rest) => Outcome::Mismatched(ev, rest),
                Outcome::Failed(e, rest) => Outcome::Failed(e, rest),
                Outcome::Cancelled => Outcome::Cancelled,
                Outcome::Ended => Outcome::Ended,
            }
        })
    }
}

pub(crate) trait MapStep<A, E>: Send {
    fn step(
        self: Box<Self>,
        cursor: Box<dyn Cursor>,
        scope: Scope<E>,
    ) -> BoxFuture<'static, Outcome<A, E>>;
}

pub(crate) struct MapNode<X, A, E, F> {
    pub(crate) prev: Episode<X, E>,
    pub(crate) f: F,
}

impl<X, A, E, F> MapStep<A, E> for MapNode<X, A, E, F>
where
    X: Send + 'static,
    A: Send + 'static,
    E: Send + 'static,
    F: FnOnce(X) -> A + Send + 'static,
{
    fn step(
        self: Box<Self>,
        cursor: Box<dyn Cursor>,
        scope: Scope<E>,
    ) -> BoxFuture<'static, Outcome<A, E>> {
        Box::pin(async move {
            match evaluate(self.prev, cursor, scope).await {
                Outcome::Matched(x, rest) => Outcome::Matched((self.f)(x), rest),
                Outcome::Mismatched(ev, rest) => Outcome::Mismatched(ev, rest),
                Outcome::Failed(e, rest) => Outcome::Failed(e, rest),
                Outcome::Cancelled => Outcome::Cancelled,
                Outcome::Ended => Outcome::Ended,
            }
        })
    }
}

/// Type-erased translation for `MapErr`: the wrapped episode keeps its own
/// original error type `E1` internally, only surfacing the translated `E2`
/// at its boundary -- the same erasure technique `BindStep` uses for its
/// intermediate value type. An enclosing `Cancellable`'s `Scope<E2>` is
/// threaded across the boundary via `matcher::translate_scope`: cancel
/// predicates (error-agnostic) apply to the inner episode exactly as they
/// would without the boundary, and an `on_cancel` effect still runs in its
/// own `E2` terms. The one irreducible gap is what happens when that
/// `on_cancel` itself fails: the failure can't be represented as an `E1`
/// value at the point `evaluate` discovers it mid-inner-episode, so it is
/// stashed and recovered here, surfaced as `Outcome::Failed(e2, ..)` with an
/// exhausted cursor standing in for the one `Cancelled` already discarded --
/// the same documented trade `TimeLimited` makes when a deadline fires.
pub(crate) trait MapErrStep<A, E2>: Send {
    fn step(
        self: Box<Self>,
        cursor: Box<dyn Cursor>,
        scope: Scope<E2>,
    ) -> BoxFuture<'static, Outcome<A, E2>>;
}

pub(crate) struct MapErrNode<A, E1, F> {
    pub(crate) inner: Episode<A, E1>,
    pub(crate) f: F,
}

impl<A, E1, E2, F> MapErrStep<A, E2> for MapErrNode<A, E1, F>
where
    A: Send + 'static,
    E1: Send + 'static,
    E2: Send + 'static,
    F: FnOnce(E1) -> E2 + Send + 'static,
{
    fn step(
        self: Box<Self>,
        cursor: Box<dyn Cursor>,
        scope: Scope<E2>,
    ) -> BoxFuture<'static, Outcome<A, E2>> {
        Box::pin(async move {
            let escalated: Arc<Mutex<Option<E2>>> = Arc::new(Mutex::new(None));
            let translated = crate::matcher::translate_scope(scope, escalated.clone());
            match evaluate(self.inner, cursor, translated).await {
                Outcome::Matched(a, rest) => Outcome::Matched(a, rest),
                Outcome::Mismatched(ev, rest) => Outcome::Mismatched(ev, rest),
                Outcome::Failed(e, rest) => Outcome::Failed((self.f)(e), rest),
                Outcome::Cancelled => match escalated.lock().unwrap().take() {
                    Some(e2) => Outcome::Failed(
                        e2,
                        Box::new(crate::cursor::StreamCursor::new(futures::stream::empty())),
                    ),
                    None => Outcome::Cancelled,
                },
                Outcome::Ended => Outcome::Ended,
            }
        })
    }
}
