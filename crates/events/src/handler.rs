//! Subscriber callbacks.
//!
//! A subscriber picks one of two typed shapes at registration time:
//! payload-only, or payload plus the originating connection. Both are
//! erased into a single callback that performs the checked downcast, so the
//! dispatch path never needs to know which shape it is calling.

use std::future::Future;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};

use crate::error::DeliveryError;
use crate::payload::{downcast_payload, ConnectionHandle, Payload};

/// What a handler returns. Errors are logged by the bus and dropped.
pub type HandlerResult = anyhow::Result<()>;

type BoxedResult = BoxFuture<'static, HandlerResult>;

/// Whether a delivery comes from the live fan-out or a replay pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Live,
    Replay,
}

/// Per-delivery information passed to every handler.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub topic: String,
    pub subscription_id: String,
    /// Dispatch-order sequence number of the event.
    pub seq: u64,
    pub mode: DeliveryMode,
}

type PayloadFn<T> = dyn Fn(DeliveryContext, Arc<T>) -> BoxedResult + Send + Sync;
type ConnectionFn<T> =
    dyn Fn(DeliveryContext, Arc<T>, Option<ConnectionHandle>) -> BoxedResult + Send + Sync;

/// A typed subscriber callback.
pub enum Handler<T> {
    /// `(context, payload)`
    Payload(Arc<PayloadFn<T>>),
    /// `(context, payload, origin connection)`
    WithConnection(Arc<ConnectionFn<T>>),
}

impl<T: Payload> Handler<T> {
    pub fn payload<F, Fut>(f: F) -> Self
    where
        F: Fn(DeliveryContext, Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self::Payload(Arc::new(move |ctx, payload| f(ctx, payload).boxed()))
    }

    pub fn with_connection<F, Fut>(f: F) -> Self
    where
        F: Fn(DeliveryContext, Arc<T>, Option<ConnectionHandle>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self::WithConnection(Arc::new(move |ctx, payload, conn| {
            f(ctx, payload, conn).boxed()
        }))
    }

    pub(crate) fn erase(self) -> ErasedHandler {
        match self {
            Self::Payload(f) => Arc::new(
                move |ctx: DeliveryContext,
                      payload: Arc<dyn Payload>,
                      _conn: Option<ConnectionHandle>| {
                    match downcast_payload::<T>(payload) {
                        Ok(typed) => f(ctx, typed).map(|r| r.map_err(DeliveryError::Handler)).boxed(),
                        Err(found) => mismatch::<T>(ctx, found),
                    }
                },
            ),
            Self::WithConnection(f) => Arc::new(
                move |ctx: DeliveryContext,
                      payload: Arc<dyn Payload>,
                      conn: Option<ConnectionHandle>| {
                    match downcast_payload::<T>(payload) {
                        Ok(typed) => f(ctx, typed, conn)
                            .map(|r| r.map_err(DeliveryError::Handler))
                            .boxed(),
                        Err(found) => mismatch::<T>(ctx, found),
                    }
                },
            ),
        }
    }
}

/// The uniform callback stored in the subscription registry.
pub(crate) type ErasedHandler = Arc<
    dyn Fn(
            DeliveryContext,
            Arc<dyn Payload>,
            Option<ConnectionHandle>,
        ) -> BoxFuture<'static, Result<(), DeliveryError>>
        + Send
        + Sync,
>;

/// Erase a handler that accepts any payload without downcasting.
pub(crate) fn erase_any<F, Fut>(f: F) -> ErasedHandler
where
    F: Fn(DeliveryContext, Arc<dyn Payload>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(
        move |ctx: DeliveryContext, payload: Arc<dyn Payload>, _conn: Option<ConnectionHandle>| {
            f(ctx, payload)
                .map(|r| r.map_err(DeliveryError::Handler))
                .boxed()
        },
    )
}

fn mismatch<T>(
    ctx: DeliveryContext,
    found: &'static str,
) -> BoxFuture<'static, Result<(), DeliveryError>> {
    future::ready(Err(DeliveryError::TypeMismatch {
        topic: ctx.topic,
        expected: std::any::type_name::<T>(),
        found,
    }))
    .boxed()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde::Serialize;

    use super::*;

    #[derive(Debug, Serialize)]
    struct Created {
        id: u32,
    }

    fn payload<T: Payload>(value: T) -> Arc<dyn Payload> {
        Arc::new(value)
    }

    fn ctx() -> DeliveryContext {
        DeliveryContext {
            topic: "thing.created".into(),
            subscription_id: "thing.created-1".into(),
            seq: 1,
            mode: DeliveryMode::Live,
        }
    }

    #[tokio::test]
    async fn payload_handler_receives_typed_value() {
        let handler = Handler::<Created>::payload(|_ctx, created| async move {
            anyhow::ensure!(created.id == 42, "wrong id");
            Ok(())
        })
        .erase();

        let result = handler(ctx(), payload(Created { id: 42 }), None).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn wrong_payload_type_is_a_mismatch() {
        let handler = Handler::<Created>::payload(|_ctx, _created| async { Ok(()) }).erase();

        let result = handler(ctx(), payload("not a Created".to_string()), None).await;
        assert_matches!(
            result,
            Err(DeliveryError::TypeMismatch { ref topic, .. }) if topic == "thing.created"
        );
    }

    #[tokio::test]
    async fn handler_errors_are_wrapped() {
        let handler =
            Handler::<Created>::payload(|_ctx, _created| async { anyhow::bail!("boom") }).erase();

        let result = handler(ctx(), payload(Created { id: 1 }), None).await;
        assert_matches!(result, Err(DeliveryError::Handler(_)));
    }

    #[tokio::test]
    async fn any_handler_skips_downcast() {
        let handler = erase_any(|_ctx, payload| async move {
            anyhow::ensure!(payload.to_json()?["id"] == 5, "wrong payload");
            Ok(())
        });

        let result = handler(ctx(), payload(Created { id: 5 }), None).await;
        assert!(result.is_ok());
    }
}
