mod http_transport;
mod session_persistence;
mod token_exchange;

pub use http_transport::*;
pub use session_persistence::*;
pub use token_exchange::*;
