//! Dependency-aware, checkpointable orchestration of multi-stage AI workflows.
//!
//! A [`stage::PipelineDefinition`] is a DAG of stages, each a list of
//! [`task::Task`]s. [`dag::PipelineExecutor`] runs the DAG level by level on
//! top of the sequential [`orchestrator::Orchestrator`], persisting every step
//! in a resumable [`session::Session`]. [`feedback::FeedbackLoop`] repairs
//! generated code against its tests, and [`checkpoint::GitCheckpointer`]
//! snapshots the workspace in git.

pub mod artifacts;
pub mod checkpoint;
pub mod config;
pub mod dag;
pub mod errors;
pub mod executor;
pub mod feedback;
pub mod logging;
pub mod orchestrator;
pub mod session;
pub mod stage;
pub mod storage;
pub mod task;
pub mod util;
