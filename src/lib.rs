//! A combinator DSL and interpreter for writing conversational bots against
//! a chat platform whose updates arrive as an asynchronous stream of
//! heterogeneous events.
//!
//! The public surface is [`scenario`]: build a [`scenario::Scenario`] out of
//! [`scenario::expect`], [`scenario::Scenario::eval`], and the combinators on
//! `Scenario`, then either [`scenario::Scenario::run`] it once against a
//! stream of [`event::Messageable`] events, or hand a factory for it to
//! [`demux::pipe`] to drive one independent instance per conversation out of
//! a shared stream of [`event::Update`]s.
//!
//! Decoding platform payloads into [`event::Update`], fetching them over the
//! wire, and invoking outbound actions are all external collaborators'
//! responsibility; this crate consumes an already-decoded event stream and
//! an effect capability (an ordinary `Future<Output = Result<A, E>>`) to run
//! outbound actions through.

mod cursor;
mod episode;

pub mod config;
pub mod demux;
pub mod event;
pub mod matcher;
pub mod pipes;
pub mod scenario;
