//! modbuild-lib: module-aware incremental build orchestration.
//!
//! An invocation flows through these phases:
//! - `scan`: extract module declarations and dependencies from unit text
//! - `graph`: resolve dependencies into a unit graph, reporting cycles and conflicts
//! - `variant`: expand units into keyed (unit, configuration) build instances
//! - `invalidation`: explain which instances must be rebuilt and why
//! - `execute`: run instances on a bounded worker pool against the `cache`
//! - `report`: summarize the outcome
//!
//! `invoke` wires the phases together for a `manifest`.

pub mod cache;
pub mod consts;
pub mod execute;
pub mod gc;
pub mod graph;
pub mod invalidation;
pub mod invoke;
pub mod manifest;
pub mod platform;
pub mod report;
pub mod scan;
pub mod store_lock;
pub mod types;
pub mod util;
pub mod variant;
