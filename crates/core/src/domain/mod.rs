pub mod conversation;
pub mod envelope;
pub mod idempotency;
pub mod trace;
