//! `nanobot-agent` — the orchestration core: tool execution, the turn
//! engine, the turn services, incident handling, and the composition root
//! that wires everything to the bus and the command queue.

pub mod agent;
pub mod context;
pub mod context_guard;
pub mod executor;
pub mod failure;
pub mod honesty;
pub mod incident;
pub mod loop_guard;
pub mod message_flow;
pub mod origin;
pub mod parse;
pub mod policy;
pub mod reply;
pub mod session_commands;
pub mod skills;
pub mod system_turn;
pub mod tools;
pub mod turn_engine;
pub mod user_turn;

pub use agent::AgentLoop;
pub use context::ContextBuilder;
pub use context_guard::{ContextEvaluation, ContextGuard, TokenCounter};
pub use executor::{RuntimeContext, ToolExecutor};
pub use failure::{FailureEvent, FailureSeverity};
pub use incident::{IncidentDecision, IncidentManager};
pub use message_flow::MessageFlowCoordinator;
pub use policy::ToolPolicy;
pub use session_commands::SessionCommands;
pub use system_turn::SystemTurnService;
pub use tools::{DeliveryContext, Tool, ToolRegistry, ToolResult, ToolSeverity};
pub use user_turn::UserTurnService;
pub use turn_engine::{ExecutionReport, TurnEngine, TurnFlags, TurnLimits};
