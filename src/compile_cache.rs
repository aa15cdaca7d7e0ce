// src/compile_cache.rs
//
// Per-instance cache of compiled logic.
//
// Compiling a logic body is the expensive part of running a block, so it
// happens once per instance and the result is kept until someone says the
// source changed. Failures are cached too: a block with a syntax error
// reports the same error every tick without re-parsing.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::LogicError;
use crate::logic::{CompiledLogic, LogicHost};
use crate::state::InstanceId;

type Entry = Result<Arc<dyn CompiledLogic>, LogicError>;

/// Compiled logic keyed by instance id.
#[derive(Default)]
pub struct CompileCache {
    entries: HashMap<InstanceId, Entry>,
}

impl CompileCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached compile result for `instance_id`, compiling
    /// `source` with `host` on a miss.
    pub fn get_or_compile(
        &mut self,
        instance_id: &str,
        source: &str,
        host: &dyn LogicHost,
    ) -> Entry {
        if let Some(entry) = self.entries.get(instance_id) {
            return entry.clone();
        }

        let entry = host.compile(source);
        if let Err(e) = &entry {
            log::warn!("logic for instance '{}' failed to compile: {}", instance_id, e);
        }
        self.entries.insert(instance_id.to_string(), entry.clone());
        entry
    }

    /// Drop one instance's entry. Returns whether anything was cached.
    pub fn evict(&mut self, instance_id: &str) -> bool {
        self.entries.remove(instance_id).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.entries.contains_key(instance_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
