// Public API - the runner and the error type it returns
pub mod error;
pub mod runner;

// Internal modules - organized by subsystem
mod config;
mod db;
mod formats;
mod output;
mod pipeline;
mod publish;
mod retry;
mod source;
mod telemetry;
