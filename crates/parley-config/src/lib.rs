pub mod cookies;
pub mod loader;
pub mod schema;

pub use cookies::load_cookies_file;
pub use loader::ConfigLoader;
pub use schema::{BackendProfile, Config, ConfigError, Preset, Workspace, SYDNEY_BACKEND};
