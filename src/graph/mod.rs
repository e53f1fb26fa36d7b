//! 对话图：路由、轮次状态、Agent 推理、各阶段与状态机

pub mod engine;
pub mod nodes;
pub mod planner;
pub mod router;
pub mod state;

pub use engine::{ConversationGraph, Stage, TurnOutcome};
pub use nodes::StageContext;
pub use planner::{parse_llm_output, Planner, PlannerOutput};
pub use router::{RoutingRule, ToolCategory, ToolRouter};
pub use state::{
    append_messages, merge_shallow, replace_if_present, CustomerProfile, LookupStatus, Message,
    PendingToolCall, StatePatch, TurnState,
};
