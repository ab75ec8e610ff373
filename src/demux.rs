//! The conversation demultiplexer: fans a single shared stream of `Update`s
//! out into one independent matching session per conversation.
//!
//! A single task owns a `HashMap` of live per-conversation state and a
//! `tokio::select!` over three things: new input arriving, a session
//! finishing, and a periodic sweep of idle entries.

use std::collections::HashMap;
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::DemuxConfig;
use crate::event::{ConversationId, Messageable, Update};
use crate::matcher::{self, SessionResult};
use crate::pipes;
use crate::scenario::Scenario;

/// Bookkeeping for one conversation's live or recently-live session.
struct ConversationEntry {
    /// `None` once the session backing this conversation has completed; a
    /// fresh event arriving afterward spins up a replacement rather than
    /// reusing this sender. An unbounded relay sender rather than the
    /// session's own bounded inbox directly: the demux task must never block
    /// or drop handing an event to *this* conversation's relay just because
    /// that conversation's session is momentarily behind (see
    /// `spawn_conversation_relay`).
    tx: Option<mpsc::UnboundedSender<Messageable>>,
    last_activity: Instant,
}

/// Runs `scenario_factory()` independently per conversation id observed on
/// `updates`, yielding one `(ConversationId, SessionResult<A, E>)` per
/// completed session. The output stream is unordered across conversations
/// but preserves source order within each one.
pub fn pipe<A, E>(
    updates: impl Stream<Item = Update> + Send + 'static,
    scenario_factory: impl Fn() -> Scenario<A, E> + Send + Sync + 'static,
    config: DemuxConfig,
) -> impl Stream<Item = (ConversationId, SessionResult<A, E>)>
where
    A: Send + 'static,
    E: Send + 'static,
{
    async_stream::stream! {
        tokio::pin!(updates);

        let mut conversations: HashMap<ConversationId, ConversationEntry> = HashMap::new();
        let mut sessions: FuturesUnordered<
            tokio::task::JoinHandle<(ConversationId, SessionResult<A, E>)>,
        > = FuturesUnordered::new();
        let mut sweep = tokio::time::interval(config.sweep_interval());
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                maybe_update = updates.next() => {
                    let Some(update) = maybe_update else { break };
                    let Some(event) = pipes::to_messageable(update) else { continue };
                    let cid = event.conversation_id();

                    let spawn_fresh = match conversations.get(&cid) {
                        Some(entry) => entry.tx.is_none(),
                        None => true,
                    };

                    if spawn_fresh {
                        tracing::debug!(conversation_id = cid, "spawning new conversation session");
                        let (relay_tx, rx) = spawn_conversation_relay(config.buffer_capacity);
                        let episode_stream = ReceiverStream::new(rx);
                        let episode = scenario_factory().build_episode();
                        sessions.push(tokio::spawn(async move {
                            let result = matcher::run(episode, episode_stream).await;
                            (cid, result)
                        }));

                        // Infallible and ordered: the relay is unbounded, so this
                        // never blocks the demux task or reorders behind a
                        // best-effort retry (see `spawn_conversation_relay`).
                        let _ = relay_tx.send(event);

                        conversations.insert(
                            cid,
                            ConversationEntry { tx: Some(relay_tx), last_activity: Instant::now() },
                        );
                    } else {
                        let entry = conversations.get_mut(&cid).expect("just checked present");
                        entry.last_activity = Instant::now();
                        let tx = entry
                            .tx
                            .as_ref()
                            .expect("spawn_fresh is false only when tx is Some");
                        let _ = tx.send(event);
                    }
                }

                Some(finished) = sessions.next(), if !sessions.is_empty() => {
                    match finished {
                        Ok((cid, result)) => {
                            tracing::debug!(conversation_id = cid, "conversation session completed");
                            if let Some(entry) = conversations.get_mut(&cid) {
                                entry.tx = None;
                                entry.last_activity = Instant::now();
                            }
                            yield (cid, result);
                        }
                        Err(join_err) => {
                            tracing::error!(error = %join_err, "conversation session task panicked");
                        }
                    }
                }

                _ = sweep.tick() => {
                    sweep_idle_conversations(&mut conversations, config.idle_eviction_interval(), Instant::now());
                }
            }
        }

        while let Some(finished) = sessions.next().await {
            if let Ok((cid, result)) = finished {
                yield (cid, result);
            }
        }
    }
}

/// Removes entries that are both session-free (`tx.is_none()`) and idle past
/// `idle` as of `now`. Pulled out of the main `select!` loop as a pure
/// function so the eviction rule itself -- not the task plumbing around it --
/// can be unit tested directly.
fn sweep_idle_conversations(
    conversations: &mut HashMap<ConversationId, ConversationEntry>,
    idle: std::time::Duration,
    now: Instant,
) {
    conversations.retain(|cid, entry| {
        let evict = entry.tx.is_none() && now.duration_since(entry.last_activity) > idle;
        if evict {
            tracing::debug!(conversation_id = cid, "evicting idle conversation");
        }
        !evict
    });
}

/// A conversation's inbox, split into two channels joined by one dedicated
/// relay task. The demux task only ever touches the unbounded sender
/// returned here, so handing it an event is synchronous and infallible --
/// it can never block the single task every other conversation also shares,
/// and it can never need a fallback path that risks reordering this
/// conversation's events relative to each other (the defect the previous
/// `try_send`-then-spawn-on-`Full` dispatch had). Backpressure still
/// applies, just downstream of the demux task: the relay task's `send` on
/// the bounded channel is what actually waits for the session to catch up,
/// one conversation at a time, in the order events arrived.
fn spawn_conversation_relay(
    buffer_capacity: usize,
) -> (mpsc::UnboundedSender<Messageable>, mpsc::Receiver<Messageable>) {
    let (relay_tx, mut relay_rx) = mpsc::unbounded_channel::<Messageable>();
    let (tx, rx) = mpsc::channel(buffer_capacity);
    tokio::spawn(async move {
        while let Some(event) = relay_rx.recv().await {
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });
    (relay_tx, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(
        tx: Option<mpsc::UnboundedSender<Messageable>>,
        age: Duration,
        now: Instant,
    ) -> ConversationEntry {
        ConversationEntry {
            tx,
            last_activity: now - age,
        }
    }

    /// Scenario 7: a session-free entry idle past the configured interval is
    /// swept; one that is still within the interval, or still has a live
    /// session, is left alone.
    #[test]
    fn sweep_evicts_only_session_free_entries_past_the_idle_interval() {
        let now = Instant::now();
        let idle = Duration::from_millis(100);
        let (tx, _rx) = mpsc::unbounded_channel();

        let mut conversations = HashMap::new();
        conversations.insert(1, entry(None, Duration::from_millis(200), now));
        conversations.insert(2, entry(None, Duration::from_millis(50), now));
        conversations.insert(3, entry(Some(tx), Duration::from_millis(200), now));

        sweep_idle_conversations(&mut conversations, idle, now);

        assert!(!conversations.contains_key(&1), "idle and session-free: evicted");
        assert!(conversations.contains_key(&2), "not idle long enough: kept");
        assert!(conversations.contains_key(&3), "session still live: kept");
    }
}
