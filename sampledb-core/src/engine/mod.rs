// engine/mod.rs
//! In-memory pipeline engine
//!
//! Executes the pipeline fragments the view and aggregation layers lower to,
//! so the store driver contract can be exercised without a database server.
//!
//! ```text
//! Pipeline (stages) ──► expr (expressions) ──► filter (query operators)
//! update (bulk write update operators)
//! ```

pub mod expr;
pub mod filter;
pub mod pipeline;
pub mod update;

pub use expr::{EvalContext, Expr};
pub use filter::matches_filter;
pub use pipeline::{haversine_distance, LookupSource, NoLookup, Pipeline, Stage};
pub use update::{apply_update, UpdateFailure};
