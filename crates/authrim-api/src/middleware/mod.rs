pub mod rate_limit;
pub mod request_id;
pub mod security_headers;

pub use rate_limit::rate_limit_middleware;
pub use request_id::request_id_middleware;
pub use security_headers::security_headers_middleware;
