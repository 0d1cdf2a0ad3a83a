#![deny(missing_docs)]
//! Library form of gvmctl

/// Command-line construction and the operation runner.
pub mod command;
/// VM settings persistence.
pub mod config;
/// Single-flight orchestration of operations and status polls.
pub mod controller;
/// Real time updates flowing from workers to the presentation layer.
pub mod output;
/// Status queries against the cloud CLI.
pub mod probe;
/// Contains console presentation code.
pub mod ui;

pub use crate::command::*;
pub use crate::config::*;
pub use crate::controller::*;
pub use crate::output::*;
pub use crate::probe::*;
pub use crate::ui::*;
