pub mod executor;
pub mod sanitize;

pub use executor::FallbackExecutor;
pub use sanitize::{sanitize, SanitizeOutcome};
