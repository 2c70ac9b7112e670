//! rollcalld: attendance daemon.
//!
//! Waits for the backend to open an attendance session, runs the camera
//! pipeline for it and posts each student's Present/Late mark once.

pub mod backend;
pub mod config;
pub mod display;
pub mod engine;
pub mod poster;
pub mod store;
pub mod supervisor;
pub mod watcher;

pub use backend::{BackendError, SessionBackend};
pub use config::Config;
