use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::Value;

use crate::backend::Backend;

#[derive(Clone, Debug)]
pub(crate) enum Reply {
    Value(Value),
    Fail(String),
    Never,
    After(Duration, Box<Reply>),
}

/// Scripted in-memory backend. `once` replies are consumed first, then the
/// sticky `on` reply; unscripted commands resolve to `null`.
#[derive(Default)]
pub(crate) struct FakeBackend {
    sticky: Mutex<HashMap<String, Reply>>,
    queued: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<(String, Value)>>,
    settled: AtomicUsize,
}

impl FakeBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn on(&self, command: &str, reply: Reply) {
        self.sticky.lock().insert(command.to_string(), reply);
    }

    pub(crate) fn once(&self, command: &str, reply: Reply) {
        self.queued
            .lock()
            .entry(command.to_string())
            .or_default()
            .push_back(reply);
    }

    pub(crate) fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    pub(crate) fn settled(&self) -> usize {
        self.settled.load(Ordering::SeqCst)
    }

    fn next_reply(&self, command: &str) -> Reply {
        if let Some(reply) = self
            .queued
            .lock()
            .get_mut(command)
            .and_then(|queue| queue.pop_front())
        {
            return reply;
        }
        self.sticky
            .lock()
            .get(command)
            .cloned()
            .unwrap_or(Reply::Value(Value::Null))
    }
}

async fn resolve(reply: Reply) -> Result<Value, String> {
    let mut reply = reply;
    loop {
        match reply {
            Reply::Value(value) => return Ok(value),
            Reply::Fail(message) => return Err(message),
            Reply::Never => std::future::pending::<()>().await,
            Reply::After(delay, inner) => {
                tokio::time::sleep(delay).await;
                reply = *inner;
            }
        }
    }
}

#[tonic::async_trait]
impl Backend for FakeBackend {
    async fn invoke(&self, command: &str, args: Value) -> Result<Value, String> {
        self.calls.lock().push((command.to_string(), args));
        let reply = self.next_reply(command);
        let outcome = resolve(reply).await;
        self.settled.fetch_add(1, Ordering::SeqCst);
        outcome
    }
}
