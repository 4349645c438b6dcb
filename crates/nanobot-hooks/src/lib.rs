//! `nanobot-hooks` — a typed observation bus for the agent core.
//!
//! A fixed set of events, each with a struct payload. Handlers are plain
//! closures registered under a name; the dispatcher isolates handler
//! failures: a panicking hook is logged and never reaches the caller.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};

/// Which event a handler subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    ToolBefore,
    ToolAfter,
    ToolError,
    TurnIterationStart,
    TurnIterationEnd,
    TurnEnd,
}

/// Emitted immediately before a tool executes.
#[derive(Debug, Clone, Serialize)]
pub struct ToolBeforePayload {
    pub tool: String,
    pub params: Value,
    pub call_hash: String,
}

/// Emitted after a tool call finishes (including interception).
#[derive(Debug, Clone, Serialize)]
pub struct ToolAfterPayload {
    pub tool: String,
    pub params: Value,
    pub call_hash: String,
    pub success: bool,
    pub severity: Option<String>,
    /// True when the executor short-circuited a repeat failure.
    pub blocked: bool,
}

/// Emitted when the executor itself fails.
#[derive(Debug, Clone, Serialize)]
pub struct ToolErrorPayload {
    pub tool: String,
    pub params: Value,
    pub call_hash: String,
    pub error: String,
}

/// Emitted at the top of each turn-engine iteration.
#[derive(Debug, Clone, Serialize)]
pub struct TurnIterationStartPayload {
    pub trace_id: Option<String>,
    pub iteration: usize,
    pub max_iterations: usize,
}

/// Emitted at the end of each turn-engine iteration.
#[derive(Debug, Clone, Serialize)]
pub struct TurnIterationEndPayload {
    pub trace_id: Option<String>,
    pub iteration: usize,
    /// e.g. "final_text", "tool_round_completed", "loop_broken".
    pub status: String,
    pub tool_calls: usize,
}

/// Emitted once per completed turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnEndPayload {
    pub trace_id: Option<String>,
    pub iterations: usize,
    pub has_content: bool,
}

/// Every observable event with its payload.
#[derive(Debug, Clone, Serialize)]
pub enum HookEvent {
    ToolBefore(ToolBeforePayload),
    ToolAfter(ToolAfterPayload),
    ToolError(ToolErrorPayload),
    TurnIterationStart(TurnIterationStartPayload),
    TurnIterationEnd(TurnIterationEndPayload),
    TurnEnd(TurnEndPayload),
}

impl HookEvent {
    pub fn kind(&self) -> HookKind {
        match self {
            HookEvent::ToolBefore(_) => HookKind::ToolBefore,
            HookEvent::ToolAfter(_) => HookKind::ToolAfter,
            HookEvent::ToolError(_) => HookKind::ToolError,
            HookEvent::TurnIterationStart(_) => HookKind::TurnIterationStart,
            HookEvent::TurnIterationEnd(_) => HookKind::TurnIterationEnd,
            HookEvent::TurnEnd(_) => HookKind::TurnEnd,
        }
    }
}

type Handler = Arc<dyn Fn(&HookEvent) + Send + Sync>;

struct Registration {
    name: String,
    kind: HookKind,
    handler: Handler,
}

/// Shared hook registry. Clone the `Arc`, not the registry.
pub struct HookRegistry {
    handlers: RwLock<Vec<Registration>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        kind: HookKind,
        handler: impl Fn(&HookEvent) + Send + Sync + 'static,
    ) {
        let name = name.into();
        debug!(hook = %name, ?kind, "hook registered");
        self.handlers
            .write()
            .expect("hook registry poisoned")
            .push(Registration {
                name,
                kind,
                handler: Arc::new(handler),
            });
    }

    /// Remove all handlers registered under `name`.
    pub fn unregister(&self, name: &str) {
        self.handlers
            .write()
            .expect("hook registry poisoned")
            .retain(|r| r.name != name);
    }

    /// Run every handler subscribed to this event's kind.
    /// One broken hook never affects the operation or the other hooks.
    pub fn emit(&self, event: &HookEvent) {
        let kind = event.kind();
        let matching: Vec<(String, Handler)> = {
            let handlers = self.handlers.read().expect("hook registry poisoned");
            handlers
                .iter()
                .filter(|r| r.kind == kind)
                .map(|r| (r.name.clone(), Arc::clone(&r.handler)))
                .collect()
        };
        for (name, handler) in matching {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(event)));
            if result.is_err() {
                error!(hook = %name, ?kind, "hook handler panicked; isolated");
            }
        }
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}
