mod build;
mod gc;
mod graph;
mod info;
mod plan;

pub use build::cmd_build;
pub use gc::cmd_gc;
pub use graph::cmd_graph;
pub use info::cmd_info;
pub use plan::cmd_plan;
