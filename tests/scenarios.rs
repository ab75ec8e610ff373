//! Black-box end-to-end scenarios, exercised purely through the public
//! `Scenario`/`matcher` surface -- no internal `Episode`/`Cursor` types.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chatter::event::{IncomingMessage, Messageable};
use chatter::matcher::SessionResult;
use chatter::pipes;
use chatter::scenario::{expect, Scenario};
use futures::future::BoxFuture;
use futures::stream;

fn text(conversation_id: i64, s: &str) -> Messageable {
    Messageable::IncomingMessage(IncomingMessage {
        message_id: 1,
        conversation_id,
        sender_id: 1,
        text: Some(s.to_string()),
        document_file_id: None,
        sent_at: 0,
    })
}

#[tokio::test]
async fn command_then_reply() {
    let scenario = expect::<String>(pipes::command("start"))
        .then(expect(pipes::text_message))
        .map(|m| m.text().unwrap().to_string());

    let events = stream::iter(vec![text(1, "/start"), text(1, "hello")]);
    let result = scenario.run(events).await;

    assert!(matches!(result, SessionResult::Matched(s) if s == "hello"));
}

#[tokio::test]
async fn tolerate_with_retry() {
    let replies = Arc::new(AtomicUsize::new(0));
    let replies_for_closure = replies.clone();

    // A message only matches this `Next` if its text parses as an integer;
    // anything else mismatches, handing control to `tolerate_n` rather than
    // failing the session outright.
    let parses_as_integer = |ev: &Messageable| {
        ev.text()
            .is_some_and(|t| t.parse::<i64>().is_ok())
    };

    let read_age: Scenario<i64, String> = expect(parses_as_integer)
        .map(|m: Messageable| m.text().unwrap().parse::<i64>().unwrap())
        .tolerate_n(2, move |_ev| {
            replies_for_closure.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) }) as BoxFuture<'static, Result<(), String>>
        });

    let scenario: Scenario<i64, String> =
        expect::<String>(pipes::command("age")).then(read_age);

    let events = stream::iter(vec![
        text(1, "/age"),
        text(1, "x"),
        text(1, "y"),
        text(1, "30"),
    ]);

    let result = scenario.run(events).await;
    assert!(matches!(result, SessionResult::Matched(30)));
    assert_eq!(replies.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn tolerate_n_surfaces_mismatch_once_limit_is_exceeded() {
    let parses_as_integer = |ev: &Messageable| ev.text().is_some_and(|t| t.parse::<i64>().is_ok());

    let read_age: Scenario<i64, String> = expect(parses_as_integer)
        .map(|m: Messageable| m.text().unwrap().parse::<i64>().unwrap())
        .tolerate_n(1, |_ev| {
            Box::pin(async { Ok(()) }) as BoxFuture<'static, Result<(), String>>
        });

    let events = stream::iter(vec![text(1, "x"), text(1, "y")]);
    let result = read_age.run(events).await;

    assert!(matches!(result, SessionResult::Mismatched(ev) if ev.text() == Some("y")));
}

#[tokio::test]
async fn cancellation_on_explicit_cancel_command() {
    let scenario = expect::<String>(pipes::command("form"))
        .then(expect(pipes::text_message))
        .stop_on(|ev| ev.text() == Some("/cancel"));

    let events = stream::iter(vec![text(1, "/form"), text(1, "/cancel")]);
    let result = scenario.run(events).await;

    assert!(matches!(result, SessionResult::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn timeout_cancels_when_no_event_arrives() {
    let scenario: Scenario<Messageable, String> =
        expect(pipes::text_message).within(Duration::from_millis(100));

    let handle = tokio::spawn(async move { scenario.run(stream::pending()).await });
    tokio::time::advance(Duration::from_millis(150)).await;

    let result = handle.await.unwrap();
    assert!(matches!(result, SessionResult::Cancelled));
}

#[tokio::test]
async fn error_recovery_without_consuming_input() {
    let scenario: Scenario<&'static str, String> = Scenario::eval(|| {
        Box::pin(async { Err("boom".to_string()) }) as BoxFuture<'static, Result<&'static str, String>>
    })
    .handle_error_with(|_| Scenario::pure("ok"));

    let result = scenario.run(stream::empty()).await;
    assert!(matches!(result, SessionResult::Matched("ok")));
}

#[tokio::test]
async fn per_conversation_isolation_via_independent_runs() {
    // The matcher itself has no notion of conversation; isolation across
    // conversations is the demultiplexer's job (see tests/demux.rs). Here we
    // confirm two independently-run sessions over interleaved per-chat
    // sub-streams each reach their own outcome.
    let scenario_for = || {
        expect::<String>(pipes::command("x"))
            .then(expect(pipes::text_message))
            .map(|m| m.text().unwrap().to_string())
    };

    let a = scenario_for().run(stream::iter(vec![text(1, "/x"), text(1, "hello")]));
    let b = scenario_for().run(stream::iter(vec![text(2, "/x"), text(2, "hi")]));

    let (a_result, b_result) = tokio::join!(a, b);
    assert!(matches!(a_result, SessionResult::Matched(s) if s == "hello"));
    assert!(matches!(b_result, SessionResult::Matched(s) if s == "hi"));
}
