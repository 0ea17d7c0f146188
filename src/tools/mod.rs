//! Tool contract, registry, and the concrete tools served to the reasoner.

pub mod odds;
pub mod parlay;
pub mod registry;
pub mod spec;
pub mod stats;
pub mod web_search;

pub use odds::OddsBoardTool;
pub use parlay::BuildParlayTool;
pub use registry::{ToolDefinition, ToolRegistry, ToolRegistryBuilder};
pub use spec::{ToolContext, ToolError, ToolProgress, ToolResult, ToolSpec};
pub use stats::StatLookupTool;
pub use web_search::WebSearchTool;
