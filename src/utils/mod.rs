pub mod connection_url;
pub use connection_url::{
    ConnectionUrlError, build_connection_url, redact_url, validate_base_url,
};
