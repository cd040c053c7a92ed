//! Local HTTP/HTTPS proxy that relays every request through an upstream SOCKS5 server.
//!
//! Plain HTTP requests are re-issued through the SOCKS5 tunnel with their `proxy-*`
//! headers removed; `CONNECT` requests get `200 Connection Established` and become
//! an opaque byte relay.

pub mod common;
pub mod net;
pub mod proxy;

pub use common::log_sink::{LogBuffer, LogForwarder, LogSink};
pub use proxy::{GatewayEvent, GatewayService, SessionOptions};
