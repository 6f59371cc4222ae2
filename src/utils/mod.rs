pub mod retryable;
pub mod slow_warn;
