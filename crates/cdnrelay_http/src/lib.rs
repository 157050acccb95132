pub mod app;
pub mod format;
pub mod rate_limit;

pub use app::{build_router, AppState, AutoDeleteConfig, HttpConfig};
pub use rate_limit::RateLimiter;
