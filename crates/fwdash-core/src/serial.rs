use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{info, trace, warn};

use crate::error::{CoreError, CoreResult};
use crate::events::SerialEvent;
use crate::gateway::CommandGateway;
use crate::notify::{Notifier, Severity};
use crate::types::PortInfo;

pub const MAX_SERIAL_LINES: usize = 10_000;
pub const SERIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const LIST_PORTS_TIMEOUT: Duration = Duration::from_secs(5);
pub const VALID_BAUD_RATES: [u32; 13] = [
    300, 1200, 2400, 4800, 9600, 14400, 19200, 38400, 57600, 115200, 230400, 460800, 921600,
];

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Connection {
    pub connection_id: String,
    pub port_path: String,
    pub baud_rate: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SerialState {
    pub available_ports: Vec<PortInfo>,
    pub connections: BTreeMap<String, Connection>,
    pub active_connection_id: Option<String>,
}

impl SerialState {
    pub fn active(&self) -> Option<&Connection> {
        self.active_connection_id
            .as_deref()
            .and_then(|id| self.connections.get(id))
    }

    fn remove_connection(&mut self, connection_id: &str) -> bool {
        if self.connections.remove(connection_id).is_none() {
            return false;
        }
        if self.active_connection_id.as_deref() == Some(connection_id) {
            self.active_connection_id = self.connections.keys().next().cloned();
        }
        true
    }
}

/// Completed lines plus the unterminated tail of one connection's output.
///
/// `received` counts every completed line ever appended, including ones
/// later evicted, so tailing readers can tell how many lines they missed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SerialBuffer {
    pub lines: VecDeque<String>,
    pub partial_line: String,
    pub received: u64,
    pending_cr: bool,
}

impl SerialBuffer {
    pub fn push_chunk(&mut self, chunk: &str, max_lines: usize) {
        if chunk.is_empty() {
            return;
        }
        let mut chunk = chunk;
        // "\r" ended the previous chunk and this one opens with "\n": one terminator.
        if std::mem::take(&mut self.pending_cr) {
            if let Some(rest) = chunk.strip_prefix('\n') {
                chunk = rest;
            }
        }
        if chunk.is_empty() {
            return;
        }
        self.pending_cr = chunk.ends_with('\r');

        let mut combined = std::mem::take(&mut self.partial_line);
        combined.push_str(chunk);
        let normalized = combined.replace("\r\n", "\n").replace('\r', "\n");

        let mut parts: Vec<&str> = normalized.split('\n').collect();
        if let Some(tail) = parts.pop() {
            self.partial_line = tail.to_string();
        }
        for line in parts {
            self.lines.push_back(line.to_string());
            self.received += 1;
        }
        while self.lines.len() > max_lines {
            self.lines.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.partial_line.clear();
        self.pending_cr = false;
    }
}

#[derive(Clone)]
pub struct SerialSessions {
    inner: Arc<SerialInner>,
}

struct SerialInner {
    gateway: CommandGateway,
    notifier: Notifier,
    state: watch::Sender<SerialState>,
    buffers: watch::Sender<BTreeMap<String, SerialBuffer>>,
}

impl SerialSessions {
    pub fn new(gateway: CommandGateway, notifier: Notifier) -> Self {
        let (state, _) = watch::channel(SerialState::default());
        let (buffers, _) = watch::channel(BTreeMap::new());
        Self {
            inner: Arc::new(SerialInner {
                gateway,
                notifier,
                state,
                buffers,
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SerialState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_buffers(&self) -> watch::Receiver<BTreeMap<String, SerialBuffer>> {
        self.inner.buffers.subscribe()
    }

    pub fn snapshot(&self) -> SerialState {
        self.inner.state.borrow().clone()
    }

    pub fn buffer(&self, connection_id: &str) -> Option<SerialBuffer> {
        self.inner.buffers.borrow().get(connection_id).cloned()
    }

    pub fn active_connection(&self) -> Option<Connection> {
        self.inner.state.borrow().active().cloned()
    }

    pub async fn refresh_ports(&self) -> Vec<PortInfo> {
        match self
            .inner
            .gateway
            .call::<Vec<PortInfo>>("list_serial_ports", Value::Null, LIST_PORTS_TIMEOUT)
            .await
        {
            Ok(ports) => {
                self.inner.state.send_modify(|state| {
                    state.available_ports = ports.clone();
                });
                ports
            }
            Err(err) => {
                warn!("list_serial_ports failed: {err}");
                self.inner
                    .notifier
                    .notify("Failed to list serial ports", Severity::Error);
                self.inner.state.borrow().available_ports.clone()
            }
        }
    }

    /// Opens a port and makes it the active connection.
    ///
    /// Failures are returned to the caller without a notification.
    pub async fn open(&self, port_path: &str, baud_rate: u32) -> CoreResult<String> {
        if !VALID_BAUD_RATES.contains(&baud_rate) {
            return Err(CoreError::Validation(format!(
                "Invalid baud rate: {baud_rate}"
            )));
        }
        let connection_id: String = self
            .inner
            .gateway
            .call(
                "open_serial",
                json!({ "portPath": port_path, "baudRate": baud_rate }),
                SERIAL_TIMEOUT,
            )
            .await?;

        self.inner.state.send_modify(|state| {
            state.connections.insert(
                connection_id.clone(),
                Connection {
                    connection_id: connection_id.clone(),
                    port_path: port_path.to_string(),
                    baud_rate,
                },
            );
            state.active_connection_id = Some(connection_id.clone());
        });
        self.inner.buffers.send_modify(|buffers| {
            buffers.insert(connection_id.clone(), SerialBuffer::default());
        });
        info!("serial {connection_id}: opened {port_path} at {baud_rate} baud");
        Ok(connection_id)
    }

    pub async fn close(&self, connection_id: &str) -> CoreResult<()> {
        match self
            .inner
            .gateway
            .call_raw(
                "close_serial",
                json!({ "connectionId": connection_id }),
                SERIAL_TIMEOUT,
            )
            .await
        {
            Ok(_) => {
                self.forget(connection_id);
                Ok(())
            }
            Err(err) => {
                warn!("serial {connection_id}: close failed: {err}");
                self.inner
                    .notifier
                    .notify(format!("Failed to close serial port: {err}"), Severity::Error);
                Err(err)
            }
        }
    }

    pub async fn write(&self, connection_id: &str, data: &str) -> CoreResult<()> {
        match self
            .inner
            .gateway
            .call_raw(
                "write_serial",
                json!({ "connectionId": connection_id, "data": data }),
                SERIAL_TIMEOUT,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!("serial {connection_id}: write failed: {err}");
                self.inner
                    .notifier
                    .notify(format!("Failed to write to serial: {err}"), Severity::Error);
                Err(err)
            }
        }
    }

    pub fn handle_event(&self, event: SerialEvent) {
        match event {
            SerialEvent::Data {
                connection_id,
                text,
            } => {
                let known = self
                    .inner
                    .state
                    .borrow()
                    .connections
                    .contains_key(&connection_id);
                if !known {
                    trace!("serial {connection_id}: dropping data for unknown connection");
                    return;
                }
                let text = text.unwrap_or_default();
                self.inner.buffers.send_modify(|buffers| {
                    buffers
                        .entry(connection_id)
                        .or_default()
                        .push_chunk(&text, MAX_SERIAL_LINES);
                });
            }
            SerialEvent::Error {
                connection_id,
                message,
            } => {
                let message = message.unwrap_or_else(|| "Unknown error".to_string());
                warn!("serial {connection_id}: {message}");
                self.inner
                    .notifier
                    .notify(format!("Serial error: {message}"), Severity::Error);
            }
            SerialEvent::Closed { connection_id } => {
                self.forget(&connection_id);
            }
        }
    }

    pub fn clear_buffer(&self, connection_id: &str) {
        self.inner.buffers.send_if_modified(|buffers| match buffers.get_mut(connection_id) {
            Some(buffer) => {
                buffer.clear();
                true
            }
            None => false,
        });
    }

    pub fn set_active(&self, connection_id: Option<&str>) {
        self.inner.state.send_modify(|state| {
            state.active_connection_id = connection_id.map(str::to_string);
        });
    }

    /// Asks the backend to reserve a port for flashing.
    pub async fn acquire_upload_lock(&self, port_path: &str) -> CoreResult<UploadLock> {
        self.inner
            .gateway
            .call_raw(
                "acquire_port_for_upload",
                json!({ "portPath": port_path }),
                SERIAL_TIMEOUT,
            )
            .await?;
        info!("upload lock acquired on {port_path}");
        Ok(UploadLock {
            sessions: self.clone(),
            port_path: port_path.to_string(),
            released: false,
        })
    }

    pub async fn release_upload_lock(&self, port_path: &str) -> CoreResult<()> {
        self.inner
            .gateway
            .call_raw(
                "release_upload_lock",
                json!({ "portPath": port_path }),
                SERIAL_TIMEOUT,
            )
            .await?;
        info!("upload lock released on {port_path}");
        Ok(())
    }

    fn forget(&self, connection_id: &str) {
        let removed = self
            .inner
            .state
            .send_if_modified(|state| state.remove_connection(connection_id));
        self.inner
            .buffers
            .send_if_modified(|buffers| buffers.remove(connection_id).is_some());
        if removed {
            info!("serial {connection_id}: closed");
        }
    }
}

/// Backend-side port reservation held for the length of an upload.
///
/// Call [`UploadLock::release`] to release it and observe the outcome. A lock
/// dropped without release is released from a background task.
pub struct UploadLock {
    sessions: SerialSessions,
    port_path: String,
    released: bool,
}

impl UploadLock {
    pub fn port_path(&self) -> &str {
        &self.port_path
    }

    pub async fn release(mut self) -> CoreResult<()> {
        self.released = true;
        self.sessions.release_upload_lock(&self.port_path).await
    }
}

impl Drop for UploadLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let sessions = self.sessions.clone();
        let port_path = std::mem::take(&mut self.port_path);
        warn!("upload lock on {port_path} dropped without release");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = sessions.release_upload_lock(&port_path).await {
                    warn!("background release of {port_path} failed: {err}");
                }
            });
        }
    }
}
