//! # dfm - dataflow build engine
//!
//! Given a declarative description of interconnected *tasks* that produce
//! and consume typed *data items*, dfm constructs a DAG of task nodes,
//! executes them with bounded concurrency and cross-process coordination,
//! and caches per-task results so unchanged subgraphs are skipped on
//! subsequent runs.
//!
//! ## Pipeline
//!
//! | Stage | Module | Responsibility |
//! |-------|--------|----------------|
//! | Load | [`loader`] | `flow.yaml` packages, fragments, imports, feeds |
//! | Model | [`package`] | Symbolic tasks/types with `uses` inheritance |
//! | Build | [`builder`] | Lower to the executable [`node`] arena |
//! | Run | [`runner`] | Dependency-ordered parallel scheduling |
//! | Coordinate | [`jobserver`] | GNU Make POSIX jobserver (named FIFO) |
//!
//! Cross-cutting: the [`expr`] mini-language with deferred evaluation,
//! [`filter`] registry for pipe transforms, [`data`] items with
//! consumes/passthrough propagation, and the [`std_tasks`] library.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use dfm::{PackageLoader, TaskGraphBuilder, TaskSetRunner, ExtRegistry};
//! use std::sync::Arc;
//!
//! let flow = PackageLoader::new().load("flow.yaml".as_ref())?;
//! let mut builder = TaskGraphBuilder::new(
//!     Arc::new(flow.symtab),
//!     Arc::new(flow.filters),
//!     Arc::new(ExtRegistry::new()),
//!     flow.root_path,
//!     "rundir".into(),
//! );
//! let root = builder.mk_task_node("build")?;
//! let mut runner = TaskSetRunner::new("rundir", -1);
//! let status = runner.run(&mut builder, root).await?;
//! # Ok::<(), dfm::DfmError>(())
//! ```

pub mod builder;
pub mod ctxt;
pub mod data;
pub mod dot;
pub mod errors;
pub mod expr;
pub mod filter;
pub mod jobserver;
pub mod loader;
pub mod node;
pub mod package;
pub mod params;
pub mod runner;
pub mod std_tasks;

pub use builder::TaskGraphBuilder;
pub use ctxt::{CancelToken, TaskRunCtxt};
pub use data::{Consumes, DataItem, Passthrough, TaskDataInput, TaskDataOutput, TaskDataResult};
pub use errors::{DfmError, Marker, Result, Severity, SrcLoc};
pub use expr::{DeferredExpr, EvalCtx, Template};
pub use filter::{FilterDef, FilterRegistry};
pub use jobserver::Jobserver;
pub use loader::{LoadedFlow, PackageLoader};
pub use node::{NodeId, TaskNode};
pub use package::{Package, SymbolTable, Task};
pub use runner::{log_listener, EventKind, Listener, TaskSetRunner};
pub use std_tasks::ExtRegistry;
