pub mod app_state;
pub mod error;
pub mod services;
pub mod sync;
pub mod utils;

pub use app_state::{AppState, init_app_state};
pub use error::{PbrSyncError, Result};
