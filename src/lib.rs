pub mod analyzer;
pub mod api;
pub mod app;
pub mod capture;
pub mod error;
pub mod ffmpeg;
pub mod history;
pub mod scheduler;
pub mod server;
pub mod source;
pub mod stats;
pub mod utils;
