// src/runtime.rs
//
// Single owner of the patch, the logic engine, the connector and the
// audio backend.
//
// Every mutation arrives as a `Command` and is applied between ticks.
// Graph-shape changes trigger a reconciliation pass right away; the logic
// loop runs only while audio is enabled and a backend is attached.

use std::time::Duration;

use crate::backend::AudioBackend;
use crate::config::EngineConfig;
use crate::connector::{AudioGraphConnector, ReconcileReport};
use crate::engine::{LogicEngine, TickReport};
use crate::error::PatchError;
use crate::logic::{ExecutionContext, LogicHost, ScriptHost};
use crate::state::{Command, CommandResult, GraphStore, Patch};

/// Coordinates the engine and connector over one patch.
///
/// Generic over the backend so that a non-`Send` browser backend and a
/// thread-owned native backend share the same code.
pub struct Runtime<B: AudioBackend> {
    config: EngineConfig,
    patch: Patch,
    engine: LogicEngine,
    connector: AudioGraphConnector,
    backend: Option<B>,

    /// Global audio enable flag (owned by the UI).
    audio_enabled: bool,

    /// Global tempo.
    bpm: f64,

    /// Whether the logic loop is currently running.
    running: bool,
}

impl<B: AudioBackend> Runtime<B> {
    /// Create a runtime with the built-in script host.
    pub fn new(config: EngineConfig, patch: Patch) -> Self {
        let host = ScriptHost::new(config.script_op_budget);
        Self::with_host(config, patch, Box::new(host))
    }

    pub fn with_host(config: EngineConfig, patch: Patch, host: Box<dyn LogicHost>) -> Self {
        let engine = LogicEngine::new(host, &config);
        let patch = patch.with_log_limit(config.max_log_lines);
        let bpm = config.default_bpm;
        Self {
            config,
            patch,
            engine,
            connector: AudioGraphConnector::new(),
            backend: None,
            audio_enabled: false,
            bpm,
            running: false,
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // State access
    // ═══════════════════════════════════════════════════════════════

    pub fn patch(&self) -> &Patch {
        &self.patch
    }

    pub fn engine(&self) -> &LogicEngine {
        &self.engine
    }

    pub fn connector(&self) -> &AudioGraphConnector {
        &self.connector
    }

    pub fn backend(&self) -> Option<&B> {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> Option<&mut B> {
        self.backend.as_mut()
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled
    }

    pub fn tick_period(&self) -> Duration {
        self.config.tick_period()
    }

    /// Audio is enabled and a backend is attached.
    pub fn is_active(&self) -> bool {
        self.audio_enabled && self.backend.is_some()
    }

    /// The logic loop is running.
    pub fn is_running(&self) -> bool {
        self.running
    }

    // ═══════════════════════════════════════════════════════════════
    // Activation
    // ═══════════════════════════════════════════════════════════════

    /// Attach the audio backend and route the current graph into it.
    pub fn attach_backend(&mut self, backend: B) {
        self.backend = Some(backend);
        self.reconcile();
        self.sync_activity();
    }

    /// Release every live route and hand the backend back.
    pub fn detach_backend(&mut self) -> Option<B> {
        if let Some(backend) = self.backend.as_mut() {
            self.connector.disconnect_all(backend);
        }
        let backend = self.backend.take();
        self.sync_activity();
        backend
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) {
        self.audio_enabled = enabled;
        self.reconcile();
        self.sync_activity();
    }

    /// Start or stop the logic loop to match the activation conditions.
    fn sync_activity(&mut self) {
        let active = self.is_active();
        if active && !self.running {
            // Fresh start: every port falls back to its last known value
            self.engine.reset_outputs(&self.patch);
            log::debug!(
                "logic loop started ({} instances, {:?} period)",
                self.patch.instances().len(),
                self.tick_period()
            );
        } else if !active && self.running {
            log::debug!("logic loop stopped");
        }
        self.running = active;
    }

    // ═══════════════════════════════════════════════════════════════
    // Tick / reconcile
    // ═══════════════════════════════════════════════════════════════

    /// Run one logic tick. Returns `None` while the loop is stopped.
    pub fn tick(&mut self) -> Option<TickReport> {
        if !self.running {
            return None;
        }
        let sample_rate = self
            .backend
            .as_ref()
            .map_or(self.config.default_sample_rate, |b| b.sample_rate());
        let context = ExecutionContext::new(sample_rate, self.bpm);
        let backend = self.backend.as_mut().map(|b| b as &mut dyn AudioBackend);
        Some(self.engine.tick(&mut self.patch, context, backend))
    }

    /// Bring live audio routing in line with the patch.
    pub fn reconcile(&mut self) -> ReconcileReport {
        let backend = self.backend.as_mut().map(|b| b as &mut dyn AudioBackend);
        self.connector
            .reconcile(&self.patch, backend, self.audio_enabled)
    }

    // ═══════════════════════════════════════════════════════════════
    // Commands
    // ═══════════════════════════════════════════════════════════════

    /// Apply one command. Always answers with exactly one result.
    pub fn apply(&mut self, command: Command) -> CommandResult {
        match command {
            Command::RegisterSpec { spec } => {
                if let Some(old) = self.patch.register_spec(spec) {
                    log::debug!("specification '{}' re-registered", old.id);
                }
                CommandResult::Ok
            }

            Command::UpdateSpec { spec } => {
                let spec_id = spec.id.clone();
                self.patch.register_spec(spec);
                let affected: Vec<String> = self
                    .patch
                    .instances_of(&spec_id)
                    .map(|i| i.id.clone())
                    .collect();
                for id in &affected {
                    self.engine.invalidate(id);
                }
                // Port types may have changed
                self.reconcile();
                CommandResult::Ok
            }

            Command::AddInstance { instance } => match self.patch.add_instance(instance) {
                Ok(()) => {
                    self.reconcile();
                    CommandResult::Ok
                }
                Err(e) => error(e),
            },

            Command::RemoveInstance { instance_id } => {
                match self.patch.remove_instance(&instance_id) {
                    Some(_) => {
                        self.engine.forget(&instance_id);
                        self.reconcile();
                        CommandResult::Ok
                    }
                    None => error(PatchError::UnknownInstance(instance_id)),
                }
            }

            Command::Connect {
                from_instance,
                from_output,
                to_instance,
                to_input,
            } => match self
                .patch
                .connect(&from_instance, &from_output, &to_instance, &to_input)
            {
                Ok(connection_id) => {
                    self.reconcile();
                    CommandResult::Connected { connection_id }
                }
                Err(e) => error(e),
            },

            Command::Disconnect { connection_id } => {
                match self.patch.disconnect(&connection_id) {
                    Some(_) => {
                        self.reconcile();
                        CommandResult::Ok
                    }
                    None => CommandResult::Error {
                        message: format!("unknown connection '{}'", connection_id),
                    },
                }
            }

            Command::SetParam {
                instance_id,
                param_id,
                value,
            } => match self.patch.set_param(&instance_id, &param_id, value) {
                Ok(()) => CommandResult::Ok,
                Err(e) => error(e),
            },

            Command::SetAudioEnabled { enabled } => {
                self.set_audio_enabled(enabled);
                CommandResult::Ok
            }

            Command::SetTempo { bpm } => {
                if !(bpm.is_finite() && bpm > 0.0) {
                    return CommandResult::Error {
                        message: format!("invalid tempo {}", bpm),
                    };
                }
                self.bpm = bpm;
                CommandResult::Ok
            }

            Command::InvalidateLogic { instance_id } => {
                match instance_id {
                    Some(id) => self.engine.invalidate(&id),
                    None => self.engine.invalidate_all(),
                }
                CommandResult::Ok
            }

            Command::DetachBackend => {
                self.detach_backend();
                CommandResult::Ok
            }

            Command::Snapshot => CommandResult::Snapshot {
                instances: self.patch.instances().to_vec(),
            },

            Command::Shutdown => {
                if let Some(backend) = self.backend.as_mut() {
                    self.connector.disconnect_all(backend);
                }
                self.audio_enabled = false;
                self.sync_activity();
                CommandResult::Ok
            }
        }
    }
}

fn error(e: PatchError) -> CommandResult {
    CommandResult::Error {
        message: e.to_string(),
    }
}
