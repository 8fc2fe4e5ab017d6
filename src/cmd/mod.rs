//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                 |
//! |-----------|----------------------------------|
//! | `run`     | `Run`                            |
//! | `check`   | `Check`                          |
//! | `config`  | `Config`                         |
//! | `session` | session file load/save (shared)  |

pub mod check;
pub mod config;
pub mod run;
pub mod session;

pub use check::cmd_check;
pub use config::{cmd_config, load_config};
pub use run::cmd_run;
