use fwdash_proto::fwdash::v1::PushEvent;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::build::BuildOrchestrator;
use crate::serial::SerialSessions;

pub const BUILD_CHANNEL: &str = "build-event";
pub const SERIAL_CHANNEL: &str = "serial-event";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BuildEvent {
    Started {
        #[serde(default)]
        app_name: Option<String>,
        #[serde(default)]
        environment: Option<String>,
    },
    Output {
        #[serde(default)]
        line: Option<String>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    Complete {
        #[serde(default)]
        success: Option<bool>,
        #[serde(default)]
        duration_ms: Option<u64>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SerialEvent {
    Data {
        connection_id: String,
        #[serde(default)]
        text: Option<String>,
    },
    Error {
        connection_id: String,
        #[serde(default)]
        message: Option<String>,
    },
    Closed {
        connection_id: String,
    },
}

/// Routes pushed notifications to the component that owns their channel.
#[derive(Clone)]
pub struct EventRouter {
    build: BuildOrchestrator,
    serial: SerialSessions,
}

impl EventRouter {
    pub fn new(build: BuildOrchestrator, serial: SerialSessions) -> Self {
        Self { build, serial }
    }

    pub fn channels() -> [&'static str; 2] {
        [BUILD_CHANNEL, SERIAL_CHANNEL]
    }

    /// Returns whether the event reached a handler.
    pub fn dispatch(&self, event: &PushEvent) -> bool {
        match event.channel.as_str() {
            BUILD_CHANNEL => match serde_json::from_str::<BuildEvent>(&event.payload_json) {
                Ok(evt) => {
                    self.build.handle_event(evt);
                    true
                }
                Err(err) => {
                    warn!("dropping malformed build event: {err}");
                    false
                }
            },
            SERIAL_CHANNEL => match serde_json::from_str::<SerialEvent>(&event.payload_json) {
                Ok(evt) => {
                    self.serial.handle_event(evt);
                    true
                }
                Err(err) => {
                    warn!("dropping malformed serial event: {err}");
                    false
                }
            },
            other => {
                debug!("dropping event for unknown channel {other}");
                false
            }
        }
    }
}

/// Feeds a subscription into the router in arrival order until it ends.
pub async fn pump_events<S>(mut stream: S, router: EventRouter) -> Result<(), tonic::Status>
where
    S: Stream<Item = Result<PushEvent, tonic::Status>> + Unpin,
{
    while let Some(item) = stream.next().await {
        match item {
            Ok(evt) => {
                router.dispatch(&evt);
            }
            Err(status) => {
                warn!("event stream error: {status}");
                return Err(status);
            }
        }
    }
    debug!("event stream ended");
    Ok(())
}
