//! 认知层：Tool Call 解析与工具调用循环

pub mod planner;
pub mod tool_loop;

pub use planner::{parse_llm_output, PlannerOutput, ToolCall};
pub use tool_loop::{ToolLoopGenerator, MAX_ITERATIONS_PROMPT};
