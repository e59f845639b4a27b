pub mod api;
pub mod config;
pub mod db;
pub mod processes;
pub mod telemetry;
