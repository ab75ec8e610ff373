//! `Scenario<A, E>`: the public, re-runnable façade over the `Episode` IR.
//!
//! An `Episode` is single-use -- `matcher::evaluate` consumes it by value,
//! and a `Bind` continuation is `FnOnce`. A `Scenario` instead wraps a
//! factory that builds a fresh `Episode` on demand, so the same scenario
//! value can seed a new matching session, or be retried wholesale by
//! `tolerate`, any number of times.

use std::sync::Arc;
use std::time::Duration;

use crate::episode::{
    BindNode, BoxEffect, Episode, MapErrNode, MapNode, OnCancelFn, PredFn, RecoverFn,
    ToleranceSpec,
};
use crate::event::Messageable;
use crate::matcher::{self, SessionResult};

/// A re-runnable description of a matching session: "the next thing that
/// happens, interpreted this way." Cloning a `Scenario` is cheap (an `Arc`
/// bump); each clone still produces an independent `Episode` per run.
pub struct Scenario<A, E> {
    build: Arc<dyn Fn() -> Episode<A, E> + Send + Sync>,
}

impl<A, E> Clone for Scenario<A, E> {
    fn clone(&self) -> Self {
        Self {
            build: self.build.clone(),
        }
    }
}

impl<A, E> Scenario<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    fn from_factory(build: impl Fn() -> Episode<A, E> + Send + Sync + 'static) -> Self {
        Self {
            build: Arc::new(build),
        }
    }

    pub(crate) fn build_episode(&self) -> Episode<A, E> {
        (self.build)()
    }

    pub(crate) fn factory(&self) -> Arc<dyn Fn() -> Episode<A, E> + Send + Sync> {
        self.build.clone()
    }

    /// A scenario that completes immediately with `value`, consuming no
    /// input.
    pub fn pure(value: A) -> Self
    where
        A: Clone,
    {
        Self::from_factory(move || Episode::Pure(value.clone()))
    }

    /// A scenario that fails immediately with `error`, consuming no input.
    pub fn raise_error(error: E) -> Self
    where
        E: Clone,
    {
        Self::from_factory(move || Episode::RaiseError(error.clone()))
    }

    /// A scenario whose result comes from running an async effect (a side
    /// effect such as sending a reply, writing to storage, or calling
    /// another service).
    pub fn eval<F>(effect: F) -> Self
    where
        F: Fn() -> BoxEffect<A, E> + Send + Sync + 'static,
    {
        Self::from_factory(move || Episode::Eval(effect()))
    }

    /// Sequences this scenario into another, threading the matched value
    /// into `k`. The monadic bind: the engine's core combinator for
    /// "wait for this, then do that."
    pub fn flat_map<B, K>(self, k: K) -> Scenario<B, E>
    where
        B: Send + 'static,
        K: Fn(A) -> Scenario<B, E> + Send + Sync + Clone + 'static,
    {
        Scenario::from_factory(move || {
            let prev = self.build_episode();
            let k = k.clone();
            Episode::Bind(Box::new(BindNode {
                prev,
                k: move |a: A| k(a).build_episode(),
            }))
        })
    }

    /// Transforms the matched value without affecting what is consumed.
    pub fn map<B, F>(self, f: F) -> Scenario<B, E>
    where
        B: Send + 'static,
        F: Fn(A) -> B + Send + Sync + Clone + 'static,
    {
        Scenario::from_factory(move || {
            let prev = self.build_episode();
            let f = f.clone();
            Episode::Map(Box::new(MapNode { prev, f }))
        })
    }

    /// Runs this scenario, then `next`, discarding this scenario's value.
    /// The sequential-composition operator (`>>` in the algebra this engine
    /// generalizes).
    pub fn then<B>(self, next: Scenario<B, E>) -> Scenario<B, E>
    where
        B: Send + 'static,
    {
        self.flat_map(move |_| next.clone())
    }

    /// Recovers from a failure by building a new scenario from the error.
    /// Mismatches and cancellation are not failures and pass through
    /// untouched.
    pub fn handle_error_with<F>(self, recover: F) -> Self
    where
        F: Fn(E) -> Scenario<A, E> + Send + Sync + Clone + 'static,
    {
        Self::from_factory(move || {
            let inner = self.build_episode();
            let recover = recover.clone();
            let recover: RecoverFn<A, E> = Arc::new(move |e: E| recover(e).build_episode());
            Episode::Protected(Box::new(inner), recover)
        })
    }

    /// Turns a failure into a matched `Err`, never propagating it further.
    pub fn attempt(self) -> Scenario<Result<A, E>, E> {
        Scenario::from_factory(move || {
            let inner = self.build_episode();
            let mapped = Episode::Map(Box::new(MapNode {
                prev: inner,
                f: Ok::<A, E> as fn(A) -> Result<A, E>,
            }));
            let recover: RecoverFn<Result<A, E>, E> = Arc::new(|e: E| Episode::Pure(Err(e)));
            Episode::Protected(Box::new(mapped), recover)
        })
    }

    /// Wraps this scenario in a cancellation scope: if the predicate matches
    /// the next event observed at any suspension point within the scenario
    /// (including nested scenarios), the session is cancelled instead of
    /// continuing to wait.
    pub fn stop_on(self, predicate: impl Fn(&Messageable) -> bool + Send + Sync + 'static) -> Self {
        let predicate: PredFn = Arc::new(predicate);
        Self::from_factory(move || {
            Episode::Cancellable(Box::new(self.build_episode()), predicate.clone(), None)
        })
    }

    /// Like `stop_on`, but runs `on_cancel` as a side effect at the moment
    /// cancellation is triggered (e.g. to notify the participant).
    pub fn stop_with<F>(
        self,
        predicate: impl Fn(&Messageable) -> bool + Send + Sync + 'static,
        on_cancel: F,
    ) -> Self
    where
        F: Fn(Messageable) -> BoxEffect<(), E> + Send + Sync + 'static,
    {
        let predicate: PredFn = Arc::new(predicate);
        let on_cancel: OnCancelFn<E> = Arc::new(on_cancel);
        Self::from_factory(move || {
            Episode::Cancellable(
                Box::new(self.build_episode()),
                predicate.clone(),
                Some(on_cancel.clone()),
            )
        })
    }

    /// Bounds this scenario's total wall-clock time. If `duration` elapses
    /// before the scenario completes, the session is cancelled; any effect
    /// in flight at that moment is left to finish independently rather than
    /// aborted, since the matcher cannot safely recover a cursor out from
    /// under an abandoned future.
    pub fn within(self, duration: Duration) -> Self {
        Self::from_factory(move || Episode::TimeLimited(Box::new(self.build_episode()), duration))
    }

    fn tolerate_with_limit<F>(self, limit: Option<u64>, on_mismatch: F) -> Self
    where
        F: Fn(Messageable) -> BoxEffect<(), E> + Send + Sync + 'static,
    {
        let inner_factory = self.build.clone();
        let on_mismatch = Arc::new(on_mismatch);
        Self::from_factory(move || {
            Episode::Tolerate(ToleranceSpec {
                inner_factory: inner_factory.clone(),
                limit,
                on_mismatch: on_mismatch.clone(),
            })
        })
    }

    /// Retries this scenario from scratch, without limit, whenever it
    /// mismatches, running `on_mismatch` as a side effect each time (e.g. to
    /// prompt the participant to try again). Failures and cancellation are
    /// not retried.
    pub fn tolerate_all<F>(self, on_mismatch: F) -> Self
    where
        F: Fn(Messageable) -> BoxEffect<(), E> + Send + Sync + 'static,
    {
        self.tolerate_with_limit(None, on_mismatch)
    }

    /// Like `tolerate_all`, but gives up and surfaces the mismatch after
    /// `limit` failed attempts.
    pub fn tolerate_n<F>(self, limit: u64, on_mismatch: F) -> Self
    where
        F: Fn(Messageable) -> BoxEffect<(), E> + Send + Sync + 'static,
    {
        self.tolerate_with_limit(Some(limit), on_mismatch)
    }

    /// `tolerate_n` with a silent (no-op) mismatch handler.
    pub fn tolerate(self, limit: u64) -> Self {
        self.tolerate_n(limit, |_| Box::pin(async { Ok(()) }))
    }

    /// Applies `f` to any error this scenario raises, without otherwise
    /// changing its behavior. The natural-transformation analogue: useful
    /// for adapting a sub-scenario's error type to an enclosing one.
    ///
    /// An outer `stop_on`/`stop_with` still reaches inside a `map_err`'d
    /// sub-scenario (see `episode::MapErrStep`, `matcher::translate_scope`):
    /// the cancel predicate and the `on_cancel` effect both carry across the
    /// boundary. The one narrow gap is a failing `on_cancel`: its error can't
    /// be represented in the inner scenario's own error type at the moment
    /// it's raised, so it is escalated once cancellation unwinds back across
    /// the boundary, surfacing as `Failed` with the inner stream already
    /// exhausted rather than the position it actually stopped at.
    pub fn map_err<E2, F>(self, f: F) -> Scenario<A, E2>
    where
        E2: Send + 'static,
        F: Fn(E) -> E2 + Send + Sync + Clone + 'static,
    {
        Scenario::from_factory(move || {
            let inner = self.build_episode();
            let f = f.clone();
            Episode::MapErr(Box::new(MapErrNode { inner, f }))
        })
    }

    /// Runs this scenario once against `stream`, consuming the prefix it
    /// needed and discarding the rest.
    pub async fn run(
        &self,
        stream: impl futures::Stream<Item = Messageable> + Send + 'static,
    ) -> SessionResult<A, E> {
        matcher::run(self.build_episode(), stream).await
    }

    /// Repeatedly rebuilds and runs this scenario against the same
    /// underlying stream, yielding one `SessionResult` per completed
    /// session until the stream ends or a session fails/cancels.
    pub fn drive(
        &self,
        stream: impl futures::Stream<Item = Messageable> + Send + 'static,
    ) -> impl futures::Stream<Item = SessionResult<A, E>> {
        matcher::drive(self.factory(), stream)
    }
}

/// Builds a fresh scenario that waits for the next event satisfying
/// `predicate`.
pub fn expect<E>(
    predicate: impl Fn(&Messageable) -> bool + Send + Sync + 'static,
) -> Scenario<Messageable, E>
where
    E: Send + 'static,
{
    let predicate: PredFn = Arc::new(predicate);
    Scenario::from_factory(move || {
        Episode::Next(predicate.clone(), Arc::new(|m: Messageable| m))
    })
}
