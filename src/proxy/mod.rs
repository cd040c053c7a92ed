pub mod forward;
pub mod http;
pub mod listener;
pub mod service;
pub mod session;
pub mod socks5;

pub use listener::{GatewayConfig, GatewayListener};
pub use service::{GatewayError, GatewayEvent, GatewayService};
pub use session::{ClientSession, SessionOptions, SessionState, UpstreamTarget};
