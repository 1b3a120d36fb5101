pub mod arch;
pub mod checkpoints;
pub mod ci;
pub mod config;
pub mod container;
pub mod error;
pub mod executor;
pub mod fsutil;
pub mod git;
pub mod graph;
pub mod kconfig;
pub mod logging;
pub mod modules;

pub use error::{Error, ErrorKind, Result};
