//! Tests for [`RealtimeSession`] against an in-process hub.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{eventually, HubConn, TestHub};
use hubwire::realtime::events;
use hubwire::{Backoff, HubClient, HubError, RealtimeSession, SessionState};
use serde::Deserialize;
use serde_json::{json, Value};

fn ok() -> Value {
    json!({"Success": true})
}

/// Expect an invocation of `target` with `args` and answer it with `reply`.
async fn answer(conn: &mut HubConn, target: &str, args: Value, reply: Value) {
    let (id, seen_target, seen_args) = conn.recv_invocation().await;
    assert_eq!(seen_target, target);
    assert_eq!(Value::from(seen_args), args);
    conn.complete(&id.unwrap(), reply).await;
}

fn client_for(hub: &TestHub) -> HubClient {
    HubClient::builder(hub.url())
        .ping_interval(None)
        .backoff(Backoff::new(
            Duration::from_millis(20),
            Duration::from_millis(100),
        ))
        .build()
        .unwrap()
}

async fn open_session(hub: &mut TestHub) -> (RealtimeSession, HubConn) {
    let opening = tokio::spawn(RealtimeSession::open(client_for(hub), "tok"));
    let mut conn = hub.accept().await;
    answer(&mut conn, "Authorize", json!(["tok"]), ok()).await;
    answer(&mut conn, "JoinUser", json!([true]), ok()).await;
    let session = opening.await.unwrap().unwrap();
    (session, conn)
}

#[tokio::test]
async fn test_open_authorizes_and_joins_user() {
    let mut hub = TestHub::start().await;
    let (session, _conn) = open_session(&mut hub).await;
    assert_eq!(session.state(), SessionState::Authorized);
    assert!(session.client().is_connected());
}

#[tokio::test]
async fn test_rejected_token_fails_open_and_closes_client() {
    let mut hub = TestHub::start().await;
    let client = client_for(&hub);
    let handle = client.clone();
    let opening = tokio::spawn(RealtimeSession::open(client, "bad"));
    let mut conn = hub.accept().await;
    answer(
        &mut conn,
        "Authorize",
        json!(["bad"]),
        json!({"Success": false, "Message": "Invalid token", "ErrorCode": 401}),
    )
    .await;

    let err = opening.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        HubError::Invocation {
            code: Some(401),
            message: Some("Invalid token".to_string())
        }
    );
    assert!(handle.is_closed());
    assert!(conn.closed_within(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_join_and_leave_track_subscriptions() {
    let mut hub = TestHub::start().await;
    let (session, mut conn) = open_session(&mut hub).await;
    let session = Arc::new(session);

    let joining = tokio::spawn({
        let session = Arc::clone(&session);
        async move {
            session.join_planet(5).await?;
            session.join_planet(3).await?;
            session.join_channel(9).await
        }
    });
    answer(&mut conn, "JoinPlanet", json!([5]), ok()).await;
    answer(&mut conn, "JoinPlanet", json!([3]), ok()).await;
    answer(&mut conn, "JoinChannel", json!([9]), ok()).await;
    joining.await.unwrap().unwrap();
    assert_eq!(session.joined_planets(), vec![3, 5]);
    assert_eq!(session.joined_channels(), vec![9]);

    let leaving = tokio::spawn({
        let session = Arc::clone(&session);
        async move {
            session.leave_planet(5).await?;
            session.leave_channel(9).await
        }
    });
    answer(&mut conn, "LeavePlanet", json!([5]), ok()).await;
    answer(&mut conn, "LeaveChannel", json!([9]), ok()).await;
    leaving.await.unwrap().unwrap();
    assert_eq!(session.joined_planets(), vec![3]);
    assert!(session.joined_channels().is_empty());
}

#[tokio::test]
async fn test_failed_join_is_not_remembered() {
    let mut hub = TestHub::start().await;
    let (session, mut conn) = open_session(&mut hub).await;
    let session = Arc::new(session);

    let joining = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.join_planet(11).await }
    });
    answer(
        &mut conn,
        "JoinPlanet",
        json!([11]),
        json!({"Success": false, "Message": "Not a member"}),
    )
    .await;
    assert!(matches!(
        joining.await.unwrap(),
        Err(HubError::Invocation { .. })
    ));
    assert!(session.joined_planets().is_empty());
}

#[tokio::test]
async fn test_subscriptions_are_restored_after_reconnect() {
    let mut hub = TestHub::start().await;
    let (session, mut conn) = open_session(&mut hub).await;
    let session = Arc::new(session);

    let joining = tokio::spawn({
        let session = Arc::clone(&session);
        async move {
            session.join_planet(5).await?;
            session.join_channel(9).await
        }
    });
    answer(&mut conn, "JoinPlanet", json!([5]), ok()).await;
    answer(&mut conn, "JoinChannel", json!([9]), ok()).await;
    joining.await.unwrap().unwrap();

    conn.close().await;
    let mut conn = hub.accept().await;
    answer(&mut conn, "Authorize", json!(["tok"]), ok()).await;
    answer(&mut conn, "JoinUser", json!([true]), ok()).await;
    answer(&mut conn, "JoinPlanet", json!([5]), ok()).await;
    answer(&mut conn, "JoinChannel", json!([9]), ok()).await;

    assert!(eventually(|| session.state() == SessionState::Authorized).await);
}

#[tokio::test]
async fn test_typed_events_are_decoded() {
    #[derive(Debug, Deserialize, PartialEq)]
    struct Message {
        #[serde(rename = "Content")]
        content: String,
    }

    let mut hub = TestHub::start().await;
    let (session, mut conn) = open_session(&mut hub).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    session.on_event(events::MESSAGE_CREATE, move |message: Message| {
        sink.lock().unwrap().push(message.content);
    });

    conn.push(events::MESSAGE_CREATE, json!([{"Content": 12}])).await;
    conn.push(events::MESSAGE_CREATE, json!([])).await;
    conn.push(events::MESSAGE_CREATE, json!([{"Content": "hello"}])).await;

    assert!(eventually(|| !seen.lock().unwrap().is_empty()).await);
    assert_eq!(*seen.lock().unwrap(), vec!["hello".to_string()]);
}

#[tokio::test]
async fn test_dropping_session_closes_client() {
    let mut hub = TestHub::start().await;
    let (session, mut conn) = open_session(&mut hub).await;
    let client = session.client().clone();

    drop(session);
    assert!(client.is_closed());
    assert!(conn.closed_within(Duration::from_secs(2)).await);
}
