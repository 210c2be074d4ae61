mod common;

use std::time::Duration;

use rust_decimal_macros::dec;
use tokio::time::timeout;
use tokio_test::assert_ok;

use common::{fields, update, FakeVenue, Login, ASSIGNED_ADDRESS, KEY};
use gl_connect::protocol::{request, FieldReader};
use gl_connect::{GlError, MarketDataSession, MarketEvent, SessionState};

async fn connected() -> (FakeVenue, MarketDataSession) {
    let venue = FakeVenue::start(Login::Accept).await;
    let session = MarketDataSession::new();
    assert_ok!(session.connect_and_login(&venue.settings()).await);
    (venue, session)
}

async fn next_event(events: &mut tokio::sync::broadcast::Receiver<MarketEvent>) -> MarketEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

fn first_field(payload: &[u8]) -> String {
    FieldReader::new(payload).next_field().unwrap_or_default()
}

#[tokio::test]
async fn test_login_uses_assigned_calling_address() {
    let (mut venue, session) = connected().await;
    assert_eq!(session.state(), SessionState::Ready);

    assert!(assert_ok!(session.subscribe(KEY).await));
    let frame = venue.expect_frame().await;
    assert_eq!(frame.request(), request::SNAPSHOT_AND_REFRESH);
    assert_eq!(frame.header.routing.calling, ASSIGNED_ADDRESS);
    assert_eq!(frame.header.routing.called, 1);
    assert_eq!(first_field(&frame.payload), KEY);
}

#[tokio::test]
async fn test_subscribe_sends_once() {
    let (mut venue, session) = connected().await;

    assert!(assert_ok!(session.subscribe(KEY).await));
    assert!(!assert_ok!(session.subscribe(KEY).await));
    venue.expect_frame().await;
    venue.expect_silence().await;
    assert_eq!(session.subscriptions(), vec![KEY.to_string()]);
}

#[tokio::test]
async fn test_snapshot_then_sparse_update() {
    let (venue, session) = connected().await;
    let mut events = session.events().subscribe();
    assert_ok!(session.subscribe(KEY).await);

    venue.push(
        request::SNAPSHOT_AND_REFRESH,
        &fields(&[KEY, "12300", "10", "12400", "15", "12350", "5", "93015"]),
    );
    match next_event(&mut events).await {
        MarketEvent::SnapshotUpdated(snapshot) => {
            assert_eq!(snapshot.bid_price, Some(dec!(123.00)));
            assert_eq!(snapshot.ask_quantity, Some(15));
            assert_eq!(snapshot.last_time.as_deref(), Some("09:30:15"));
        }
        other => panic!("unexpected event {:?}", other),
    }

    venue.push(request::REALTIME_UPDATE, &update(KEY, &[(1, "12345")]));
    match next_event(&mut events).await {
        MarketEvent::SnapshotUpdated(snapshot) => {
            assert_eq!(snapshot.bid_price, Some(dec!(123.45)));
            assert_eq!(snapshot.ask_price, Some(dec!(124.00)));
        }
        other => panic!("unexpected event {:?}", other),
    }

    let cached = session.snapshot(KEY).unwrap();
    assert_eq!(cached.bid_price, Some(dec!(123.45)));
}

#[tokio::test]
async fn test_frames_survive_fragmentation_and_garbage() {
    let (venue, session) = connected().await;
    let mut events = session.events().subscribe();
    assert_ok!(session.subscribe(KEY).await);

    let frame = gl_connect::protocol::build_message(
        &update(KEY, &[(3, "9999")]),
        request::REALTIME_UPDATE,
        gl_connect::Routing::new(ASSIGNED_ADDRESS, 1),
    )
    .unwrap();
    venue.push_raw(b"\x00\xffnoise");
    for chunk in frame.chunks(3) {
        venue.push_raw(chunk);
    }

    match next_event(&mut events).await {
        MarketEvent::SnapshotUpdated(snapshot) => assert_eq!(snapshot.ask_price, Some(dec!(99.99))),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_updates_for_unsubscribed_keys_are_dropped() {
    let (venue, session) = connected().await;
    let mut events = session.events().subscribe();

    venue.push(request::REALTIME_UPDATE, &update(KEY, &[(1, "100")]));
    venue.push(request::SNAPSHOT, &fields(&[KEY, "200"]));

    // Only the one-shot snapshot is surfaced, and it is not cached
    match next_event(&mut events).await {
        MarketEvent::SnapshotUpdated(snapshot) => assert_eq!(snapshot.bid_price, Some(dec!(2.00))),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(session.snapshot(KEY).is_none());
}

#[tokio::test]
async fn test_unsubscribe_evicts_and_sends_stop() {
    let (mut venue, session) = connected().await;
    let mut events = session.events().subscribe();
    assert_ok!(session.subscribe(KEY).await);
    venue.expect_frame().await;

    venue.push(request::SNAPSHOT_AND_REFRESH, &fields(&[KEY, "100"]));
    next_event(&mut events).await;
    assert!(session.snapshot(KEY).is_some());

    assert!(assert_ok!(session.unsubscribe(KEY).await));
    assert!(!assert_ok!(session.unsubscribe(KEY).await));
    let frame = venue.expect_frame().await;
    assert_eq!(frame.request(), request::STOP_REFRESH);
    assert_eq!(first_field(&frame.payload), KEY);
    venue.expect_silence().await;
    assert!(session.snapshot(KEY).is_none());
}

#[tokio::test]
async fn test_load_dictionary() {
    let (mut venue, session) = connected().await;
    let catalog = vec![("40".to_string(), "00".to_string())];

    let (loaded, _) = tokio::join!(
        session.load_dictionary(&catalog, Duration::ZERO, Duration::from_millis(300)),
        async {
            let frame = venue.expect_frame().await;
            assert_eq!(frame.request(), request::DICTIONARY);
            let mut reader = FieldReader::new(&frame.payload);
            assert_eq!(reader.next_field().as_deref(), Some("40"));
            assert_eq!(reader.next_field().as_deref(), Some("00"));

            venue.push(
                request::DICTIONARY,
                &fields(&["400000001000ABC", "Example SA", "ABC", "PL0000012345", ""]),
            );
            venue.push(
                request::DICTIONARY,
                &fields(&[
                    "400000001000XYZ", "Other SA", "XYZ", "PL0000099999", "",
                    "400000001000ABC", "Example SA", "ABC", "PL0000012345", "",
                ]),
            );
        }
    );

    let instruments = assert_ok!(loaded);
    assert_eq!(instruments.len(), 2);
    assert_eq!(instruments[0].glid, "400000001000");
    assert_eq!(instruments[0].symbol, "ABC");
    assert_eq!(instruments[0].name, "Example SA");
    assert_eq!(instruments[0].local_code, "ABC");
    assert_eq!(instruments[0].isin, "PL0000012345");
    assert_eq!(instruments[1].symbol, "XYZ");
}

#[tokio::test]
async fn test_disconnect_unsubscribes_and_is_idempotent() {
    let (mut venue, session) = connected().await;
    assert_ok!(session.subscribe(KEY).await);
    assert_ok!(session.subscribe("400000001000XYZ").await);
    venue.expect_frame().await;
    venue.expect_frame().await;

    session.disconnect().await;
    let mut stopped = vec![
        first_field(&venue.expect_frame().await.payload),
        first_field(&venue.expect_frame().await.payload),
    ];
    stopped.sort();
    assert_eq!(stopped, vec![KEY.to_string(), "400000001000XYZ".to_string()]);

    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.subscriptions().is_empty());
    session.disconnect().await;
    assert!(matches!(session.subscribe(KEY).await, Err(GlError::NotConnected)));
}

#[tokio::test]
async fn test_peer_close_moves_to_disconnected() {
    let (venue, session) = connected().await;
    let mut events = session.events().subscribe();
    let mut state = session.watch_state();
    assert_ok!(session.subscribe(KEY).await);

    venue.hang_up();
    assert!(matches!(next_event(&mut events).await, MarketEvent::Disconnected));
    assert_ok!(assert_ok!(
        timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == SessionState::Disconnected)
        )
        .await
    ));
    assert!(session.subscriptions().is_empty());

    // Reconnecting is an explicit call
    let venue = FakeVenue::start(Login::Accept).await;
    assert_ok!(session.connect_and_login(&venue.settings()).await);
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn test_login_rejected() {
    let venue = FakeVenue::start(Login::Reject("17")).await;
    let session = MarketDataSession::new();
    let result = session.connect_and_login(&venue.settings()).await;
    assert!(matches!(result, Err(GlError::LoginFailed(_))));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_login_wrong_response() {
    let venue = FakeVenue::start(Login::WrongRequest).await;
    let session = MarketDataSession::new();
    let result = session.connect_and_login(&venue.settings()).await;
    assert!(matches!(result, Err(GlError::LoginFailed(_))));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_login_timeout() {
    let venue = FakeVenue::start(Login::Silent).await;
    let session = MarketDataSession::new();
    let settings = venue.settings().with_login_timeout(Duration::from_millis(200));
    let result = session.connect_and_login(&settings).await;
    assert!(matches!(result, Err(GlError::ConnectionTimeout)));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_second_connect_rejected() {
    let (venue, session) = connected().await;
    let result = session.connect_and_login(&venue.settings()).await;
    assert!(matches!(result, Err(GlError::AlreadyConnected)));
    assert_eq!(session.state(), SessionState::Ready);
}
