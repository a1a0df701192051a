//! Tests receiving links

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use fe2o3_amqp_lifecycle::{
    engine::Delivery, link::DEFAULT_CREDIT_WINDOW, Error, Event, LinkCloseOptions, LinkState,
    ReceiverOptions,
};
use fe2o3_amqp_types::{
    definitions::AmqpError,
    messaging::Outcome,
};
use tokio_test::{assert_ready, task};

mod common;

#[tokio::test]
async fn message_handler_without_error_handler_is_refused_at_once() {
    let (connection, engine) = common::setup_connection().await;
    let session = connection.create_session(None).await.unwrap();

    let mut create =
        task::spawn(session.create_receiver(ReceiverOptions::default().on_message(|_| {}), None));
    let result = assert_ready!(create.poll());
    assert!(matches!(result, Err(Error::Configuration(_))));
    assert!(engine.sessions()[0].links().is_empty());
}

#[tokio::test]
async fn error_handler_without_message_handler_creates_no_session() {
    let (connection, engine) = common::setup_connection().await;

    let mut create = task::spawn(
        connection.create_receiver(ReceiverOptions::default().on_error(|_| {}), None),
    );
    let result = assert_ready!(create.poll());
    assert!(matches!(result, Err(Error::Configuration(_))));
    assert!(engine.sessions().is_empty());
}

#[tokio::test]
async fn manual_credit_allows_a_single_handler() {
    let (connection, _engine) = common::setup_connection().await;
    let receiver = connection
        .create_receiver(
            ReceiverOptions::default()
                .credit_window(0)
                .on_message(|_| {}),
            None,
        )
        .await
        .unwrap();
    assert_eq!(receiver.credit(), 0);

    receiver.add_credit(5);
    assert_eq!(receiver.credit(), 5);
}

#[tokio::test]
async fn default_credit_window_is_granted_on_attach() {
    let (connection, _engine) = common::setup_connection().await;
    let receiver = connection
        .create_receiver(ReceiverOptions::default().source("q1"), None)
        .await
        .unwrap();
    assert_eq!(receiver.state(), LinkState::Open);
    assert_eq!(receiver.credit(), DEFAULT_CREDIT_WINDOW);
}

#[tokio::test]
async fn messages_reach_the_handler_and_are_settled() {
    let (connection, engine) = common::setup_connection().await;

    let received: Arc<Mutex<Vec<(Delivery, Option<String>, Option<String>)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let r = received.clone();
    let receiver = connection
        .create_receiver(
            ReceiverOptions::default()
                .source("q1")
                .on_message(move |context| {
                    let delivery = context.delivery.clone().unwrap();
                    let body = context
                        .message
                        .as_ref()
                        .map(|payload| String::from_utf8_lossy(payload).into_owned());
                    r.lock()
                        .unwrap()
                        .push((delivery, body, context.session_id.clone()));
                })
                .on_error(|_| {}),
            None,
        )
        .await
        .unwrap();

    let link = engine.find_link(receiver.name()).unwrap();
    link.deliver("first");
    link.deliver("second");
    link.deliver("third");
    assert_eq!(receiver.credit(), DEFAULT_CREDIT_WINDOW - 3);

    let received = received.lock().unwrap().clone();
    assert_eq!(received.len(), 3);
    assert_eq!(received[0].1.as_deref(), Some("first"));
    assert_eq!(received[0].2.as_deref(), Some(receiver.session().id().as_str()));

    receiver.accept(&received[0].0);
    receiver.reject(
        &received[1].0,
        Some(common::amqp_error(AmqpError::DecodeError, "cannot decode")),
    );
    receiver.release(&received[2].0);

    let settlements = link.settlements();
    assert_eq!(settlements.len(), 3);
    assert!(matches!(settlements[0], (id, Outcome::Accepted(_)) if id == received[0].0.id));
    assert!(matches!(settlements[1].1, Outcome::Rejected(_)));
    assert!(matches!(settlements[2].1, Outcome::Released(_)));
}

#[tokio::test]
async fn drain_is_reported() {
    let (connection, engine) = common::setup_connection().await;
    let drained = Arc::new(AtomicUsize::new(0));
    let d = drained.clone();
    let receiver = connection
        .create_receiver(
            ReceiverOptions::default().on_drained(move |_| {
                d.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        )
        .await
        .unwrap();

    receiver.drain_credit();
    common::wait_until(|| drained.load(Ordering::SeqCst) == 1).await;
    assert_eq!(receiver.credit(), 0);
    assert!(engine.find_link(receiver.name()).is_some());
}

#[tokio::test]
async fn handled_receiver_error_does_not_bubble() {
    let (connection, engine) = common::setup_connection().await;
    let handled = Arc::new(AtomicUsize::new(0));
    let h = handled.clone();
    let receiver = connection
        .create_receiver(
            ReceiverOptions::default()
                .on_message(|_| {})
                .on_error(move |_| {
                    h.fetch_add(1, Ordering::SeqCst);
                }),
            None,
        )
        .await
        .unwrap();

    let bubbled = Arc::new(AtomicUsize::new(0));
    let b = bubbled.clone();
    connection.events().on(Event::ReceiverError, move |_| {
        b.fetch_add(1, Ordering::SeqCst);
    });

    engine
        .find_link(receiver.name())
        .unwrap()
        .close_remote(Some(common::amqp_error(
            AmqpError::ResourceDeleted,
            "queue deleted",
        )));
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(bubbled.load(Ordering::SeqCst), 0);
    assert_eq!(receiver.state(), LinkState::Error);
}

#[tokio::test]
async fn closing_a_receiver_can_keep_its_session() {
    let (connection, engine) = common::setup_connection().await;
    let receiver = connection
        .create_receiver(ReceiverOptions::default(), None)
        .await
        .unwrap();

    receiver
        .close(LinkCloseOptions::keep_session(), None)
        .await
        .unwrap();
    assert_eq!(receiver.state(), LinkState::Closed);
    assert!(receiver.session().is_open());
    assert!(engine.find_link(receiver.name()).unwrap().is_removed());

    receiver.session().close(None).await.unwrap();
}
