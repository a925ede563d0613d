//! CLI command implementations.
//!
//! | Module       | Commands handled                  |
//! |--------------|-----------------------------------|
//! | `run`        | `Run`, `Resume`, `Groups`         |
//! | `session`    | `Sessions`, `Status`              |
//! | `feedback`   | `Feedback`                        |
//! | `checkpoint` | `Checkpoints`, `Rollback`         |
//! | `config`     | `Config`                          |

pub mod checkpoint;
pub mod config;
pub mod feedback;
pub mod run;
pub mod session;

pub use checkpoint::{cmd_checkpoints, cmd_rollback};
pub use config::cmd_config;
pub use feedback::cmd_feedback;
pub use run::{RunOptions, cmd_groups, cmd_resume, cmd_run};
pub use session::{cmd_sessions, cmd_status};
