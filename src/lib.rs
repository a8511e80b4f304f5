#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod blueprint;
pub mod config;
mod core;
mod engine;
mod error;
pub mod project;
pub mod resolver;
pub mod tasks;
mod utils;

pub use crate::blueprint::{Blueprint, Pipeline, TaskDef};
pub use crate::config::PipelineConfig;
pub use crate::core::{Content, Environment, FileRecord, FileSet, Mode};
pub use crate::engine::runner::{Diagnostics, Session, TaskExecution};
#[cfg(feature = "live")]
pub use crate::engine::runner::watch::{ChangeStream, Dispatcher};
pub use crate::engine::{Scope, TaskContext};
pub use crate::error::*;
pub use crate::project::Project;
pub use crate::resolver::{ComponentResolver, ManifestResolver};
pub use crate::utils::{as_overhead, init_logging};
