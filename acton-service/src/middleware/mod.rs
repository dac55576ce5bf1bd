//! Cross-cutting HTTP middleware outside the Stage Pipeline itself.

pub mod request_tracking;
pub mod security_headers;

pub use request_tracking::{sensitive_headers_layer, SENSITIVE_HEADERS};
pub use security_headers::apply_security_headers;
