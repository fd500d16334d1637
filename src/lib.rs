pub mod db;
pub mod digits;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod migrate;
pub mod model;
pub mod reminders;
pub mod security;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod time;

pub use error::{AppError, AppResult};
pub use logging::init_logging;
pub use state::AppState;
