//! # presence-daemon
//!
//! The `presenced` binary around [`presence_core`]: command line, root
//! directory, logging, capability detection, signal translation and the
//! default logging event handler.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod capability;
pub mod cli;
pub mod daemon;
pub mod handler;
pub mod logging;
pub mod signals;

pub use cli::Cli;
pub use daemon::run;
pub use handler::LoggingHandler;
