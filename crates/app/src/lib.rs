//! Terminal chat client for a streaming data-analysis backend.

pub mod controller;
pub mod error;
pub mod logging;
pub mod render;
pub mod settings;
pub mod shell;

pub use controller::{ChatCommand, ChatController, ControllerConfig};
pub use error::{AppError, AppResult};
pub use settings::{Settings, SettingsError, SettingsStore};
