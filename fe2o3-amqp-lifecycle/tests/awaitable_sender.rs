//! Tests sends that resolve with the receiver's outcome

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use fe2o3_amqp_lifecycle::{
    engine::EngineSender, AwaitableSenderOptions, Disposition, Error, Event, Link,
    LinkCloseOptions, SendOptions,
};
use fe2o3_amqp_types::{
    definitions::{AmqpError, ErrorCondition, LinkError, SessionError},
    messaging::{Accepted, Outcome, Rejected},
};
use tokio_test::{assert_pending, task};
use tokio_util::sync::CancellationToken;

mod common;

#[tokio::test]
async fn accepted_send_resolves_with_the_delivery() {
    let (_connection, engine, sender, link) =
        common::setup_awaitable_sender(AwaitableSenderOptions::default().target("q1")).await;
    engine.update_config(|config| config.outcome = Some(Outcome::Accepted(Accepted {})));

    let delivery = sender.send("hello", SendOptions::default()).await.unwrap();
    assert!(delivery.settled);
    assert!(matches!(delivery.remote_state, Some(Outcome::Accepted(_))));
    assert_eq!(sender.pending_count(), 0);
    assert_eq!(&link.deliveries()[0].1[..], b"hello");
}

#[tokio::test]
async fn rejected_send_carries_the_remote_error() {
    let (_connection, engine, sender, _link) =
        common::setup_awaitable_sender(AwaitableSenderOptions::default()).await;
    let error = common::amqp_error(AmqpError::DecodeError, "malformed payload");
    engine.update_config(|config| {
        config.outcome = Some(Outcome::Rejected(Rejected { error: Some(error) }))
    });

    match sender.send("hello", SendOptions::default()).await {
        Err(Error::SendOperationFailed(failed)) => {
            assert_eq!(failed.disposition, Disposition::Rejected);
            let remote = failed.remote_error.unwrap();
            assert!(matches!(
                remote.condition,
                ErrorCondition::AmqpError(AmqpError::DecodeError)
            ));
            assert!(failed.delivery.settled);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(sender.pending_count(), 0);
}

#[tokio::test]
async fn released_and_modified_sends_fail() {
    let (_connection, _engine, sender, link) =
        common::setup_awaitable_sender(AwaitableSenderOptions::default()).await;

    let s = sender.clone();
    let released = tokio::spawn(async move { s.send("a", SendOptions::default()).await });
    let s = sender.clone();
    let modified = tokio::spawn(async move { s.send("b", SendOptions::default()).await });
    common::wait_until(|| sender.pending_count() == 2).await;

    let ids: Vec<_> = link.deliveries().iter().map(|(d, _)| d.id).collect();
    for (delivery, payload) in link.deliveries() {
        if &payload[..] == b"a" {
            assert!(link.release(delivery.id));
        } else {
            assert!(link.modify(delivery.id));
        }
    }
    assert_eq!(ids.len(), 2);

    let released = released.await.unwrap().unwrap_err();
    assert_eq!(released.disposition(), Some(Disposition::Released));
    let modified = modified.await.unwrap().unwrap_err();
    assert_eq!(modified.disposition(), Some(Disposition::Modified));
}

#[tokio::test]
async fn first_disposition_wins() {
    let (_connection, _engine, sender, link) =
        common::setup_awaitable_sender(AwaitableSenderOptions::default()).await;

    let s = sender.clone();
    let send = tokio::spawn(async move { s.send("once", SendOptions::default()).await });
    common::wait_until(|| sender.pending_count() == 1).await;

    let id = link.deliveries()[0].0.id;
    assert!(link.accept(id));
    // The peer reports another outcome for the same delivery
    assert!(link.reject(id, None));

    let delivery = send.await.unwrap().unwrap();
    assert_eq!(delivery.id, id);
    assert_eq!(sender.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_each_get_their_own_outcome() {
    let (_connection, _engine, sender, link) =
        common::setup_awaitable_sender(AwaitableSenderOptions::default()).await;

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let sender = sender.clone();
            tokio::spawn(async move { sender.send(format!("m{}", i), SendOptions::default()).await })
        })
        .collect();
    common::wait_until(|| sender.pending_count() == 20).await;

    for (delivery, _) in link.deliveries() {
        if delivery.id % 2 == 0 {
            assert!(link.accept(delivery.id));
        } else {
            assert!(link.release(delivery.id));
        }
    }

    let mut accepted = 0;
    let mut released = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(delivery) => {
                assert_eq!(delivery.id % 2, 0);
                accepted += 1;
            }
            Err(error) => {
                assert_eq!(error.disposition(), Some(Disposition::Released));
                released += 1;
            }
        }
    }
    assert_eq!((accepted, released), (10, 10));
    assert_eq!(sender.pending_count(), 0);
}

#[tokio::test]
async fn link_error_fails_every_pending_send() {
    let (_connection, _engine, sender, link) =
        common::setup_awaitable_sender(AwaitableSenderOptions::default()).await;

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let sender = sender.clone();
            tokio::spawn(async move { sender.send("x", SendOptions::default()).await })
        })
        .collect();
    common::wait_until(|| sender.pending_count() == 5).await;

    link.close_remote(Some(common::amqp_error(
        LinkError::DetachForced,
        "detached by admin",
    )));
    assert_eq!(sender.pending_count(), 0);

    for handle in handles {
        match handle.await.unwrap() {
            Err(Error::Protocol(error)) => assert!(matches!(
                error.condition,
                ErrorCondition::LinkError(LinkError::DetachForced)
            )),
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[tokio::test]
async fn session_error_fails_every_pending_send() {
    let (_connection, engine, sender, _link) =
        common::setup_awaitable_sender(AwaitableSenderOptions::default()).await;

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let sender = sender.clone();
            tokio::spawn(async move { sender.send("x", SendOptions::default()).await })
        })
        .collect();
    common::wait_until(|| sender.pending_count() == 3).await;

    engine.sessions()[0].close_remote(Some(common::amqp_error(
        SessionError::WindowViolation,
        "window exceeded",
    )));
    assert_eq!(sender.pending_count(), 0);

    for handle in handles {
        match handle.await.unwrap() {
            Err(Error::Protocol(error)) => assert!(matches!(
                error.condition,
                ErrorCondition::SessionError(SessionError::WindowViolation)
            )),
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[tokio::test]
async fn own_error_handler_keeps_pending_sends() {
    let handled = Arc::new(AtomicUsize::new(0));
    let h = handled.clone();
    let options = AwaitableSenderOptions::default()
        .on_error(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .send_timeout(Duration::from_secs(5));
    let (_connection, _engine, sender, link) = common::setup_awaitable_sender(options).await;

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let sender = sender.clone();
            tokio::spawn(async move { sender.send("x", SendOptions::default()).await })
        })
        .collect();
    common::wait_until(|| sender.pending_count() == 5).await;

    link.close_remote(Some(common::amqp_error(
        AmqpError::InternalError,
        "broker failure",
    )));
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(sender.pending_count(), 5);

    let failed = sender.fail_pending(Error::Cancelled(String::from("link lost")));
    assert_eq!(failed, 5);
    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }
    assert_eq!(sender.pending_count(), 0);
}

#[tokio::test]
async fn send_times_out_without_outcome() {
    let (_connection, _engine, sender, _link) =
        common::setup_awaitable_sender(AwaitableSenderOptions::default()).await;

    let started = tokio::time::Instant::now();
    let err = sender
        .send("late", SendOptions::default().timeout(Duration::from_millis(50)))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is_timeout());
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(500));
    assert_eq!(sender.pending_count(), 0);
}

#[tokio::test]
async fn send_timeout_of_the_sender_is_the_default_deadline() {
    let options = AwaitableSenderOptions::default().send_timeout(Duration::from_millis(30));
    let (_connection, _engine, sender, _link) = common::setup_awaitable_sender(options).await;
    assert_eq!(sender.send_timeout(), Duration::from_millis(30));

    let err = sender.send("late", SendOptions::default()).await.unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn late_outcome_after_cancellation_is_ignored() {
    let (_connection, _engine, sender, link) =
        common::setup_awaitable_sender(AwaitableSenderOptions::default()).await;
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        child.cancel();
    });

    let err = sender
        .send("x", SendOptions::default().cancel(token))
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(sender.pending_count(), 0);

    // The transfer was handed over and the peer may still settle it
    let id = link.deliveries()[0].0.id;
    assert!(link.accept(id));
    assert_eq!(sender.pending_count(), 0);
}

#[tokio::test]
async fn cancelled_token_sends_nothing() {
    let (_connection, _engine, sender, link) =
        common::setup_awaitable_sender(AwaitableSenderOptions::default()).await;
    let token = CancellationToken::new();
    token.cancel();

    let err = sender
        .send("x", SendOptions::default().cancel(token))
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(link.deliveries().is_empty());
}

#[tokio::test]
async fn no_credit_sends_nothing() {
    let (_connection, _engine, sender, link) =
        common::setup_awaitable_sender(AwaitableSenderOptions::default()).await;
    link.set_credit(0);
    assert!(!sender.sendable());

    let err = sender.send("x", SendOptions::default()).await.unwrap_err();
    assert!(matches!(err, Error::InsufficientCredit(_)));
    assert!(link.deliveries().is_empty());
    assert_eq!(sender.pending_count(), 0);
}

#[tokio::test]
async fn no_credit_granted_on_attach() {
    let (connection, engine) = common::setup_connection().await;
    engine.update_config(|config| config.credit = 0);
    let sender = connection
        .create_awaitable_sender(AwaitableSenderOptions::default(), None)
        .await
        .unwrap();

    let err = sender.send("x", SendOptions::default()).await.unwrap_err();
    assert!(matches!(err, Error::InsufficientCredit(_)));
}

#[tokio::test]
async fn close_fails_pending_sends() {
    let (_connection, _engine, sender, _link) =
        common::setup_awaitable_sender(AwaitableSenderOptions::default()).await;

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let sender = sender.clone();
            tokio::spawn(async move { sender.send("x", SendOptions::default()).await })
        })
        .collect();
    common::wait_until(|| sender.pending_count() == 3).await;

    sender.close(LinkCloseOptions::default(), None).await.unwrap();
    assert_eq!(sender.pending_count(), 0);
    assert!(!sender.session().is_open());

    for handle in handles {
        match handle.await.unwrap() {
            Err(Error::Protocol(error)) => assert!(matches!(
                error.condition,
                ErrorCondition::AmqpError(AmqpError::IllegalState)
            )),
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[tokio::test]
async fn dropping_a_send_removes_its_entry() {
    let (_connection, _engine, sender, link) =
        common::setup_awaitable_sender(AwaitableSenderOptions::default()).await;

    let mut send = task::spawn(sender.send("x", SendOptions::default()));
    assert_pending!(send.poll());
    assert_eq!(sender.pending_count(), 1);

    drop(send);
    assert_eq!(sender.pending_count(), 0);
    assert_eq!(link.deliveries().len(), 1);
}

#[tokio::test]
async fn disconnect_fails_every_pending_send() {
    let options = AwaitableSenderOptions::default().send_timeout(Duration::from_secs(5));
    let (_connection, engine, sender, _link) = common::setup_awaitable_sender(options).await;
    let disconnects = Arc::new(AtomicUsize::new(0));
    let d = disconnects.clone();
    sender.events().on(Event::Disconnected, move |_| {
        d.fetch_add(1, Ordering::SeqCst);
    });

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let sender = sender.clone();
            tokio::spawn(async move { sender.send("x", SendOptions::default()).await })
        })
        .collect();
    common::wait_until(|| sender.pending_count() == 5).await;

    let started = tokio::time::Instant::now();
    engine.disconnect(None);
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(sender.pending_count(), 0);

    for handle in handles {
        match handle.await.unwrap() {
            Err(Error::Disconnected { connection_id, .. }) => {
                assert_eq!(connection_id, common::CONNECTION_ID)
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn own_error_handler_keeps_pending_sends_on_disconnect() {
    let options = AwaitableSenderOptions::default()
        .on_error(|_| {})
        .send_timeout(Duration::from_secs(5));
    let (_connection, engine, sender, _link) = common::setup_awaitable_sender(options).await;

    let send = {
        let sender = sender.clone();
        tokio::spawn(async move { sender.send("x", SendOptions::default()).await })
    };
    common::wait_until(|| sender.pending_count() == 1).await;

    engine.disconnect(None);
    assert_eq!(sender.pending_count(), 1);

    assert_eq!(sender.fail_pending(Error::Cancelled(String::from("gone"))), 1);
    assert!(send.await.unwrap().unwrap_err().is_cancelled());
}

#[tokio::test]
async fn closing_through_the_link_fails_pending_sends() {
    let (_connection, _engine, sender, _link) =
        common::setup_awaitable_sender(AwaitableSenderOptions::default()).await;

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let sender = sender.clone();
            tokio::spawn(async move { sender.send("x", SendOptions::default()).await })
        })
        .collect();
    common::wait_until(|| sender.pending_count() == 3).await;

    let link: &Link<dyn EngineSender> = &sender;
    link.close(LinkCloseOptions::keep_session(), None)
        .await
        .unwrap();
    assert_eq!(sender.pending_count(), 0);

    for handle in handles {
        match handle.await.unwrap() {
            Err(Error::Protocol(error)) => assert!(matches!(
                error.condition,
                ErrorCondition::AmqpError(AmqpError::IllegalState)
            )),
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[tokio::test]
async fn removing_the_link_fails_pending_sends() {
    let (_connection, _engine, sender, link) =
        common::setup_awaitable_sender(AwaitableSenderOptions::default()).await;

    let send = {
        let sender = sender.clone();
        tokio::spawn(async move { sender.send("x", SendOptions::default()).await })
    };
    common::wait_until(|| sender.pending_count() == 1).await;

    sender.remove();
    assert!(link.is_removed());
    match send.await.unwrap() {
        Err(Error::Protocol(error)) => assert!(matches!(
            error.condition,
            ErrorCondition::AmqpError(AmqpError::IllegalState)
        )),
        other => panic!("unexpected {:?}", other),
    }
}
