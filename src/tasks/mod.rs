pub mod auditor;
pub mod lifecycle_ticker;
