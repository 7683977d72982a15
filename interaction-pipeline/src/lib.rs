pub mod callback;
pub mod cleanup;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod lifecycle;
