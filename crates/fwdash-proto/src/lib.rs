//! Wire types for the backend bridge.
//!
//! The bridge exposes two RPCs: a unary `Invoke` that forwards a named command
//! with JSON arguments, and a server-streaming `Subscribe` that delivers pushed
//! notifications for the requested channels. Payloads stay JSON so the command
//! surface can grow without touching this crate.

pub mod fwdash {
    pub mod v1 {
        tonic::include_proto!("fwdash.v1");
    }
}
