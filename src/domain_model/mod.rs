mod conversation;
mod request;
mod session;

pub use conversation::*;
pub use request::*;
pub use session::*;
