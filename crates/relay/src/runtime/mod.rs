pub mod callback_url;
pub mod callbacks;
pub mod cancel;
pub mod confirm;
pub mod idempotency;
pub mod rate_limit;
pub mod tools;
