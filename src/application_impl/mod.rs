mod chat_channel_impl;
mod refresh_coordinator;
mod request_authorizer_impl;
mod session_expiry;
mod session_store_impl;

pub use chat_channel_impl::*;
pub use refresh_coordinator::*;
pub use request_authorizer_impl::*;
pub use session_expiry::*;
pub use session_store_impl::*;
