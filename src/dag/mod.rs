//! DAG resolution and parallel stage execution.
//!
//! ## Architecture
//!
//! 1. **Builder** - validates a pipeline definition into a [`StageGraph`] and
//!    layers it into [`ParallelGroup`]s with Kahn's algorithm
//! 2. **Executor** - runs the groups level by level, fanning out inside a
//!    level and joining before the next one starts
//! 3. **State** - the [`ExecutionStatus`] summary and [`PipelineEvent`] stream
//!
//! ## Example
//!
//! ```
//! use pipewright::dag::find_parallel_groups;
//! use pipewright::stage::{PipelineDefinition, Stage};
//!
//! let def = PipelineDefinition::new(
//!     "tool",
//!     vec![
//!         Stage::new("design", "Design", vec![], vec![]),
//!         Stage::new("code", "Code", vec![], vec!["design".to_string()]),
//!         Stage::new("tests", "Tests", vec![], vec!["design".to_string()]),
//!     ],
//! );
//! let groups = find_parallel_groups(&def).unwrap();
//! assert_eq!(groups[0].stages, vec!["design"]);
//! assert_eq!(groups[1].stages, vec!["code", "tests"]);
//! ```

mod builder;
mod executor;
mod state;

pub use builder::{ParallelGroup, StageGraph, StageIndex, find_parallel_groups};
pub use executor::{DEFAULT_STAGE_TIMEOUT, ExecutorConfig, PipelineExecutor};
pub use state::{ExecutionStatus, ExecutionTimer, PipelineEvent};
