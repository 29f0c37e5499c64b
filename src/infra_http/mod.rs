mod http_transport_reqwest;
mod token_exchange_http;

pub use http_transport_reqwest::*;
pub use token_exchange_http::*;
