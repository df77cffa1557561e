use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::{
    sync::oneshot::{self, error::RecvError},
    time::Instant,
};
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::error::{CoreError, CoreResult};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounds every backend call with a timer. Exactly one outcome reaches the
/// caller: the backend's value, its rejection, or a timeout.
#[derive(Clone)]
pub struct CommandGateway {
    backend: Arc<dyn Backend>,
}

impl CommandGateway {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub async fn call<T: DeserializeOwned>(
        &self,
        command: &str,
        args: Value,
        bound: Duration,
    ) -> CoreResult<T> {
        let value = self.call_raw(command, args, bound).await?;
        serde_json::from_value(value).map_err(|source| CoreError::Decode {
            command: command.to_string(),
            source,
        })
    }

    pub async fn call_raw(&self, command: &str, args: Value, bound: Duration) -> CoreResult<Value> {
        let settled = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = oneshot::channel();
        let started = Instant::now();

        // The backend call runs detached so that a timeout abandons only our wait,
        // never the backend work itself.
        let backend = Arc::clone(&self.backend);
        let flag = Arc::clone(&settled);
        let name = command.to_string();
        tokio::spawn(async move {
            let outcome = backend.invoke(&name, args).await;
            if flag.swap(true, Ordering::AcqRel) {
                debug!("{name}: discarding settlement that arrived after timeout");
                return;
            }
            let _ = tx.send(outcome);
        });

        tokio::select! {
            received = &mut rx => settle(command, received, started),
            _ = tokio::time::sleep(bound) => {
                if settled.swap(true, Ordering::AcqRel) {
                    // Settled in the same tick as the timer; the value is already queued.
                    settle(command, rx.await, started)
                } else {
                    warn!("{command} timed out after {}ms", bound.as_millis());
                    Err(CoreError::timeout(command, bound))
                }
            }
        }
    }
}

fn settle(
    command: &str,
    received: Result<Result<Value, String>, RecvError>,
    started: Instant,
) -> CoreResult<Value> {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match received {
        Ok(Ok(value)) => {
            debug!("{command} settled in {elapsed_ms}ms");
            Ok(value)
        }
        Ok(Err(message)) => {
            debug!("{command} rejected after {elapsed_ms}ms: {message}");
            Err(CoreError::Backend {
                command: command.to_string(),
                message,
            })
        }
        Err(_) => Err(CoreError::Backend {
            command: command.to_string(),
            message: "backend call aborted".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, Reply};
    use serde_json::json;

    fn gateway(backend: &Arc<FakeBackend>) -> CommandGateway {
        CommandGateway::new(backend.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn returns_backend_result_and_passes_args() {
        let backend = FakeBackend::new();
        backend.on("calc", Reply::Value(json!(42)));

        let result: i64 = gateway(&backend)
            .call("calc", json!({ "x": 1, "y": 2 }), DEFAULT_TIMEOUT)
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(backend.calls(), vec![("calc".to_string(), json!({ "x": 1, "y": 2 }))]);
    }

    #[tokio::test(start_paused = true)]
    async fn never_settling_call_times_out_after_the_bound() {
        let backend = FakeBackend::new();
        backend.on("slow_cmd", Reply::Never);
        let start = Instant::now();

        let err = gateway(&backend)
            .call_raw("slow_cmd", Value::Null, Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Command 'slow_cmd' timed out after 50ms");
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn backend_rejection_propagates_as_backend_error() {
        let backend = FakeBackend::new();
        backend.on("broken_cmd", Reply::Fail("Backend error".into()));

        let err = gateway(&backend)
            .call_raw("broken_cmd", Value::Null, DEFAULT_TIMEOUT)
            .await
            .unwrap_err();

        match err {
            CoreError::Backend { command, message } => {
                assert_eq!(command, "broken_cmd");
                assert_eq!(message, "Backend error");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn late_settlement_after_timeout_is_discarded() {
        let backend = FakeBackend::new();
        backend.on(
            "late_ok",
            Reply::After(Duration::from_millis(100), Box::new(Reply::Value(json!("late")))),
        );
        backend.on(
            "late_err",
            Reply::After(Duration::from_millis(100), Box::new(Reply::Fail("late".into()))),
        );
        let gw = gateway(&backend);

        let ok = gw.call_raw("late_ok", Value::Null, Duration::from_millis(50)).await;
        let err = gw.call_raw("late_err", Value::Null, Duration::from_millis(50)).await;
        assert!(ok.unwrap_err().is_timeout());
        assert!(err.unwrap_err().is_timeout());

        // Let both backend calls finish; nothing panics and the gateway keeps working.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(backend.settled(), 2);

        backend.on("ping", Reply::Value(json!("pong")));
        let pong: String = gw.call("ping", Value::Null, DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(pong, "pong");
    }

    #[tokio::test(start_paused = true)]
    async fn result_of_the_wrong_shape_is_a_decode_error() {
        let backend = FakeBackend::new();
        backend.on("run_build", Reply::Value(json!("yes")));

        let err = gateway(&backend)
            .call::<bool>("run_build", Value::Null, DEFAULT_TIMEOUT)
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::Decode { ref command, .. } if command == "run_build"));
    }
}
