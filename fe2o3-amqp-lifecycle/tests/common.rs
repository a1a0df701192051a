#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use fe2o3_amqp_lifecycle::{
    engine::mock::{MockConfig, MockConnection, MockLink},
    AwaitableSender, AwaitableSenderOptions, Connection, ConnectionOptions,
};
use fe2o3_amqp_types::definitions::{self, ErrorCondition};

pub const CONNECTION_ID: &str = "test-connection";

/// Wraps a mock connection without opening it
pub fn unopened(config: MockConfig, operation_timeout: Duration) -> (Connection, Arc<MockConnection>) {
    let engine = MockConnection::with_config(CONNECTION_ID, "test-container", config);
    let options = ConnectionOptions::builder()
        .connection_id(CONNECTION_ID)
        .operation_timeout(operation_timeout)
        .build();
    let connection = Connection::from_engine(engine.clone(), options);
    (connection, engine)
}

pub async fn setup_connection_with(
    config: MockConfig,
    operation_timeout: Duration,
) -> (Connection, Arc<MockConnection>) {
    let (connection, engine) = unopened(config, operation_timeout);
    connection.open(None).await.unwrap();
    (connection, engine)
}

pub async fn setup_connection() -> (Connection, Arc<MockConnection>) {
    setup_connection_with(MockConfig::default(), Duration::from_secs(5)).await
}

pub async fn setup_awaitable_sender(
    options: AwaitableSenderOptions,
) -> (Connection, Arc<MockConnection>, AwaitableSender, Arc<MockLink>) {
    let (connection, engine) = setup_connection().await;
    let sender = connection
        .create_awaitable_sender(options, None)
        .await
        .unwrap();
    let link = engine.find_link(sender.name()).unwrap();
    (connection, engine, sender, link)
}

pub fn amqp_error(condition: impl Into<ErrorCondition>, description: &str) -> definitions::Error {
    definitions::Error {
        condition: condition.into(),
        description: Some(description.to_string()),
        info: None,
    }
}

/// Polls `condition` until it holds, panics after two seconds
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met in time");
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
