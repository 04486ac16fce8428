pub mod diagnostics_route;
pub mod review_route;
pub mod webhook_route;
