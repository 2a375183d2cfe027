#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod builder;
mod config;
mod error;
mod graph;
mod handle;
pub mod preset;
mod task;
#[cfg(feature = "logging")]
mod utils;
mod value;

pub use petgraph::graph::NodeIndex;

pub use crate::builder::TaskBuilder;
pub use crate::config::Config;
pub use crate::error::*;
pub use crate::graph::{NodeInfo, TaskGraph};
pub use crate::handle::TaskHandle;
pub use crate::task::{Arg, Inputs, TaskResult};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
pub use crate::value::Value;
