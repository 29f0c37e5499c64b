mod chat_channel;
mod request_authorizer;
mod session_store;

pub use chat_channel::*;
pub use request_authorizer::*;
pub use session_store::*;
