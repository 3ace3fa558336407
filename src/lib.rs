//! Resumable, concurrent HLS downloader engine and task-management core.
//!
//! A [`TaskManager`] admits [`model::Plan`]s produced by [`analyzer::Analyzer`]
//! (or scheduled via [`scheduler::Scheduler`]) and drives each to completion
//! as a [`task::Task`], fanning out progress and lifecycle events through an
//! [`events::EventBus`]. See each module's doc comment for its slice of the
//! design.

pub mod analyzer;
pub mod cipher;
pub mod config;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod http;
pub mod logging;
pub mod manager;
pub mod merger;
pub mod model;
pub mod playlist;
pub mod scheduler;
pub mod task;

pub use config::Configuration;
pub use error::{Result, VidtaniumError};
pub use manager::TaskManager;
pub use model::{Plan, PriorityClass, TaskSnapshot, TaskStatus};
