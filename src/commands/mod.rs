pub mod bootstrap;
pub mod parallel_sync;
pub mod sync;

pub use bootstrap::{BootstrapArgs, cmd_bootstrap};
pub use parallel_sync::cmd_parallel_sync;
pub use sync::cmd_sync;
