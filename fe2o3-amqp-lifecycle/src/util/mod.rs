//! Common utilities

use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, ProtocolError},
    event::EventContext,
};

mod guard;
pub(crate) use guard::*;

/// Fails with [`Error::Cancelled`] if the token has already been cancelled
pub(crate) fn ensure_not_cancelled(
    cancel: Option<&CancellationToken>,
    message: impl FnOnce() -> String,
) -> Result<(), Error> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(Error::Cancelled(message())),
        _ => Ok(()),
    }
}

/// Resolves when the token is cancelled, never resolves without a token
pub(crate) async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// The error carried by a close or error event, or an internal error if the peer sent none
pub(crate) fn remote_error(context: &EventContext, fallback: &str) -> Error {
    match &context.error {
        Some(error) => Error::Protocol(error.clone()),
        None => Error::Protocol(ProtocolError::internal(format!(
            "{} ({})",
            fallback, context.event
        ))),
    }
}

/// The error an operation fails with when the connection is disconnected underneath it
pub(crate) fn disconnected(context: &EventContext) -> Error {
    Error::Disconnected {
        connection_id: context.connection_id.clone(),
        cause: context.error.clone(),
    }
}

#[cfg(test)]
mod tests {
    use fe2o3_amqp_types::definitions::{ErrorCondition, SessionError};
    use tokio_util::sync::CancellationToken;

    use super::{disconnected, ensure_not_cancelled, remote_error};
    use crate::{
        error::{Error, ProtocolError},
        event::{Event, EventContext},
    };

    #[test]
    fn ensure_not_cancelled_only_fails_on_cancelled_token() {
        let token = CancellationToken::new();
        assert!(ensure_not_cancelled(None, String::new).is_ok());
        assert!(ensure_not_cancelled(Some(&token), String::new).is_ok());

        token.cancel();
        let err = ensure_not_cancelled(Some(&token), || String::from("open")).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn remote_error_prefers_the_error_of_the_event() {
        let context = EventContext::new(Event::SessionError, "c")
            .error(ProtocolError::new(SessionError::UnattachedHandle, None));
        match remote_error(&context, "session error") {
            Error::Protocol(error) => assert!(matches!(
                error.condition,
                ErrorCondition::SessionError(SessionError::UnattachedHandle)
            )),
            other => panic!("unexpected {:?}", other),
        }

        let context = EventContext::new(Event::SessionClose, "c");
        let error = remote_error(&context, "session closed by the peer");
        assert!(error.to_string().contains("session closed by the peer"));
    }

    #[test]
    fn disconnected_keeps_the_connection_id() {
        let context = EventContext::new(Event::Disconnected, "connection-7");
        match disconnected(&context) {
            Error::Disconnected {
                connection_id,
                cause,
            } => {
                assert_eq!(connection_id, "connection-7");
                assert!(cause.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
