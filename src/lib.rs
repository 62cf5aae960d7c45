pub mod animation;
pub mod calibration;
pub mod config;
pub mod error;
pub mod persist;
pub mod pipeline;
pub mod pose;
pub mod reconstruction;
