mod channel_connector;
mod connection_manager;
mod port;
mod stomp;
mod ws_connector;

pub use channel_connector::*;
pub use connection_manager::*;
pub use port::*;
pub use stomp::*;
pub use ws_connector::*;
