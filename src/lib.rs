//! ExoLink - UDP link between an EMG application, an exoskeleton motor server
//! and a model training server.
//!
//! The [`controller::MotorController`] owns every socket and background task;
//! the lower-level pieces live in [`network`] and [`protocol`].

pub mod config;
pub mod controller;
pub mod network;
pub mod protocol;

pub use config::Config;
pub use controller::{ControllerError, ControllerResult, ListenerAddrs, MotorController};
