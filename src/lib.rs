//! Watch-time gated chat invites, plus a small ffmpeg relay launcher.

pub mod api;
pub mod config;
pub mod credentials;
pub mod error;
pub mod progress;
pub mod relay;
pub mod telegram;
pub mod user_store;
