pub mod logging;
pub mod util;

pub use logging::{init_tracing, LogHandle};
pub use util::{timeout, token};
