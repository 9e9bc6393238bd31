//! The `Agent` record (§3): `{id, memory, guard, driver-config}`. An agent
//! owns its memory and guard exclusively; the scheduler only ever touches
//! them by running [`crate::executor::run_turn`] against this handle.

use std::sync::Arc;

use conclave_llm::{ChatDriver, ToolDefinition};
use parking_lot::Mutex;

use crate::guard::GuardRail;
use crate::memory::Memory;

/// Per-agent driver configuration: which model to call and which tools to
/// advertise (§6 `chat(messages, {model, tools, ...})`).
pub struct DriverConfig {
    pub driver: Arc<ChatDriver>,
    pub tools: Vec<ToolDefinition>,
}

/// One conversational participant. `memory` and `guard` are mutated only by
/// this agent's own turn executor (§5); `mutedUntil`/`respondingHint` live on
/// the scheduler, not here, per §5's shared-resource ownership rules.
pub struct Agent {
    pub id: String,
    pub memory: Memory,
    pub guard: Mutex<GuardRail>,
    pub driver_config: DriverConfig,
}

impl Agent {
    pub fn new(
        id: impl Into<String>,
        memory: Memory,
        guard: GuardRail,
        driver_config: DriverConfig,
    ) -> Self {
        Self {
            id: id.into(),
            memory,
            guard: Mutex::new(guard),
            driver_config,
        }
    }
}
