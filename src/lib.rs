//! `archive_bridge` — a format bridge for hierarchical AI-ready dataset archives.
//!
//! Converts between a single-file "ZIP form" archive and an expanded directory "FOLDER
//! form" of the same logical dataset, and exports arbitrary filtered or concatenated views
//! of a dataset into either form. The core is a three-phase plan / execute / finalize
//! pipeline (see [`plan`], [`execute`], [`finalize`]) built on top of the metadata engine
//! ([`metadata`]) that reindexes identifiers across a filtered or concatenated hierarchical
//! tree.
//!
//! Dependency order: [`table`] and [`view`] (data-model types) → [`metadata`] → [`plan`] →
//! [`execute`] and [`finalize`]. [`pipeline`] composes all three phases for the common
//! single-call case, including the scoped temporary folder used by export-to-archive.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod archive_writer;
pub mod chunker;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod execute;
pub mod finalize;
pub mod metadata;
pub mod pipeline;
pub mod plan;
pub mod table;
pub mod view;

pub use error::{BridgeError, BridgeResult, ErrorKind};
pub use plan::{ArchiveRef, Plan, Task};
pub use table::Table;
pub use view::DatasetView;
