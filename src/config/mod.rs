//! Configuration.
//!
//! Tiers, merged field by field (later wins):
//! 1. **Defaults** - built in
//! 2. **Project** - `./task-dispatch/config.yaml`
//! 3. **User** - `~/.task-dispatch/config.yaml`
//!
//! An explicit file (`--config` or `TASK_DISPATCH_CONFIG_PATH`) replaces
//! tiers 2 and 3.
//!
//! ## Environment Variables
//! - `TASK_DISPATCH_CONFIG_PATH` - Explicit config file
//! - `TASK_DISPATCH_DB_PATH` - Database path
//! - `TASK_DISPATCH_STATE_DIR` - PID/stop file directory
//! - `TASK_DISPATCH_POLL_INTERVAL` - Seconds between scheduler cycles

mod loader;
mod merge;
mod types;

pub use loader::{ConfigLoader, ConfigPaths, ConfigTier};
pub use merge::{deep_merge, deep_merge_all};
pub use types::*;
