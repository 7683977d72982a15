pub mod classifier;
pub mod event;
pub mod health;
pub mod kv;
pub mod metrics;
pub mod retry;
pub mod storage;
