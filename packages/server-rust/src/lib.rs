//! socialstream server: domain services with bounded store operations,
//! events propagated over topic exchanges, and an HTTP surface per role.

pub mod app;
pub mod broker;
pub mod config;
pub mod network;
pub mod service;
pub mod storage;
pub mod telemetry;

pub use app::{App, Stores};
pub use config::{AppConfig, Role};
