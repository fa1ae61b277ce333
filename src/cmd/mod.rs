//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `start`  | `Start`          |
//! | `init`   | `Init`           |
//! | `serve`  | `Serve`          |

pub mod init;
pub mod serve;
pub mod start;

pub use init::cmd_init;
pub use serve::cmd_serve;
pub use start::cmd_start;
