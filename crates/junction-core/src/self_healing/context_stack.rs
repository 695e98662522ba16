//! Call-context stacks for circular re-entry detection.
//!
//! Each scope (typically one pipeline run) owns a stack of context names.
//! Entering a name already on the scope's stack is a cycle: it is logged and
//! recorded, and the caller is told not to proceed. Nothing is raised.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

const CYCLE_HISTORY: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub at: DateTime<Utc>,
    pub chain: String,
}

#[derive(Debug, Default)]
struct TrackerState {
    stacks: HashMap<String, Vec<String>>,
    cycles: VecDeque<CycleRecord>,
    total_cycles: u64,
}

#[derive(Debug, Default)]
pub struct CallContextTracker {
    state: Mutex<TrackerState>,
}

impl CallContextTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Push `context` onto `scope`'s stack. Returns `false` (and pushes
    /// nothing) when `context` is already on the stack.
    pub fn enter(&self, scope: &str, context: &str) -> bool {
        let mut state = self.lock();
        let stack = state.stacks.entry(scope.to_string()).or_default();
        if stack.iter().any(|c| c == context) {
            let chain = stack
                .iter()
                .map(String::as_str)
                .chain(std::iter::once(context))
                .collect::<Vec<_>>()
                .join(" -> ");
            Self::push_cycle(&mut state, chain);
            return false;
        }
        stack.push(context.to_string());
        true
    }

    /// Pop `context` if it is on top of `scope`'s stack. A mismatched exit
    /// leaves the stack untouched and returns `false`.
    pub fn exit(&self, scope: &str, context: &str) -> bool {
        let mut state = self.lock();
        let Some(stack) = state.stacks.get_mut(scope) else {
            return false;
        };
        if stack.last().map(String::as_str) != Some(context) {
            return false;
        }
        stack.pop();
        if stack.is_empty() {
            state.stacks.remove(scope);
        }
        true
    }

    /// Enter `context` for the guard's lifetime, or `None` on a cycle.
    pub fn guard(self: &Arc<Self>, scope: &str, context: &str) -> Option<ContextGuard> {
        self.enter(scope, context).then(|| ContextGuard {
            tracker: Arc::clone(self),
            scope: scope.to_string(),
            context: context.to_string(),
        })
    }

    /// Record a cycle detected elsewhere (e.g. a refused hub call chain).
    pub fn record_cycle(&self, chain: &str) {
        let mut state = self.lock();
        Self::push_cycle(&mut state, chain.to_string());
    }

    fn push_cycle(state: &mut TrackerState, chain: String) {
        warn!(chain = %chain, "circular call context detected");
        state.total_cycles += 1;
        if state.cycles.len() == CYCLE_HISTORY {
            state.cycles.pop_front();
        }
        state.cycles.push_back(CycleRecord {
            at: Utc::now(),
            chain,
        });
    }

    pub fn total_cycles(&self) -> u64 {
        self.lock().total_cycles
    }

    /// Most recent cycles, newest first.
    pub fn recent_cycles(&self, limit: usize) -> Vec<CycleRecord> {
        self.lock().cycles.iter().rev().take(limit).cloned().collect()
    }

    pub fn depth(&self, scope: &str) -> usize {
        self.lock().stacks.get(scope).map_or(0, Vec::len)
    }

    pub fn active_scopes(&self) -> usize {
        self.lock().stacks.len()
    }
}

/// Exits its context on drop.
pub struct ContextGuard {
    tracker: Arc<CallContextTracker>,
    scope: String,
    context: String,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.tracker.exit(&self.scope, &self.context);
    }
}
