pub mod app;
pub mod categorize;
pub mod cli;
pub mod config;
pub mod errors;
pub mod gmail;
pub mod oauth;
pub mod storage;
pub mod sync;
pub mod types;
