pub mod app_state;
pub mod credentials;
pub mod diagnostics;
pub mod http;
