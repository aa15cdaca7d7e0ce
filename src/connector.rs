// src/connector.rs
//
// Audio graph connector.
//
// Keeps the backend's live audio routing in line with the declared
// connection list. Each pass computes the routes the graph wants, connects
// only what is new or changed and disconnects only what went away. Routes
// that are already live are never touched, since re-patching a running
// node is audible.

use std::collections::BTreeMap;

use crate::backend::{
    ALL_PASS_DELAY_PARAM, ALL_PASS_FEEDBACK_PARAM, AllPassNodes, AudioBackend, NodeHandle,
    ParamHandle, RegistryKind, RouteTarget,
};
use crate::state::{Connection, GraphStore, PortType};

/// A live connection in the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRoute {
    pub source: NodeHandle,
    pub target: RouteTarget,
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub connected: usize,
    pub disconnected: usize,
    /// Backend calls that failed (logged and skipped).
    pub failed: usize,
}

/// Reconciles declared audio connections against live backend routing.
///
/// The active-routing record is keyed by connection id, or by
/// `<id>-path1` / `<id>-path2` for the two halves of an all-pass fan-out.
#[derive(Debug, Default)]
pub struct AudioGraphConnector {
    active: BTreeMap<String, ActiveRoute>,
}

impl AudioGraphConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live routes.
    pub fn route_count(&self) -> usize {
        self.active.len()
    }

    pub fn route(&self, key: &str) -> Option<&ActiveRoute> {
        self.active.get(key)
    }

    /// Bring live routing in line with the store's connections.
    ///
    /// With no backend, a context that is not running, or audio disabled,
    /// every live route is released instead.
    pub fn reconcile(
        &mut self,
        store: &dyn GraphStore,
        backend: Option<&mut dyn AudioBackend>,
        enabled: bool,
    ) -> ReconcileReport {
        let Some(backend) = backend else {
            // Backend is gone; its nodes went with it
            self.active.clear();
            return ReconcileReport::default();
        };
        if !enabled || !backend.is_running() {
            return self.disconnect_all(backend);
        }

        let mut report = ReconcileReport::default();
        let desired = desired_routes(store, &*backend);

        for (key, route) in &desired {
            if self.active.get(key) == Some(route) {
                continue;
            }
            // Endpoints moved: release the old route first
            if let Some(old) = self.active.remove(key) {
                release(backend, key, &old, &mut report);
            }

            match backend.connect(route.source, &route.target) {
                Ok(()) => {
                    self.active.insert(key.clone(), route.clone());
                    report.connected += 1;
                }
                Err(e) => {
                    log::warn!("route '{}' ({} -> {}): {}", key, route.source, route.target, e);
                    report.failed += 1;
                }
            }
        }

        let stale: Vec<String> = self
            .active
            .keys()
            .filter(|key| !desired.contains_key(*key))
            .cloned()
            .collect();
        for key in stale {
            if let Some(old) = self.active.remove(&key) {
                release(backend, &key, &old, &mut report);
            }
        }

        if report != ReconcileReport::default() {
            log::debug!(
                "reconcile: +{} -{} ({} failed), {} live",
                report.connected,
                report.disconnected,
                report.failed,
                self.active.len()
            );
        }
        report
    }

    /// Disconnect every live route and clear the record.
    pub fn disconnect_all(&mut self, backend: &mut dyn AudioBackend) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for (key, route) in std::mem::take(&mut self.active) {
            release(backend, &key, &route, &mut report);
        }
        report
    }
}

fn release(
    backend: &mut dyn AudioBackend,
    key: &str,
    route: &ActiveRoute,
    report: &mut ReconcileReport,
) {
    match backend.disconnect(route.source, &route.target) {
        Ok(()) => report.disconnected += 1,
        Err(e) => {
            log::warn!("releasing route '{}': {}", key, e);
            report.failed += 1;
        }
    }
}

/// Every route the declared graph asks for, keyed like the active record.
fn desired_routes(
    store: &dyn GraphStore,
    backend: &dyn AudioBackend,
) -> BTreeMap<String, ActiveRoute> {
    let mut routes = BTreeMap::new();

    for conn in store.connections() {
        if !is_audio_edge(store, conn) {
            continue;
        }
        let Some(source) = resolve_source(backend, &conn.from_instance_id) else {
            log::debug!("route '{}': no live source for '{}'", conn.id, conn.from_instance_id);
            continue;
        };

        let dest = &conn.to_instance_id;
        let param_target = store
            .instance(dest)
            .and_then(|inst| store.specification(inst))
            .and_then(|spec| spec.find_input(&conn.to_input_id).cloned())
            .and_then(|port| port.param_target);

        if let Some(param) = param_target.and_then(|name| resolve_param(backend, dest, &name)) {
            routes.insert(
                conn.id.clone(),
                ActiveRoute {
                    source,
                    target: RouteTarget::Param(param),
                },
            );
        } else if let Some(all_pass) = resolve_all_pass(backend, dest) {
            routes.insert(
                format!("{}-path1", conn.id),
                ActiveRoute {
                    source,
                    target: RouteTarget::Node(all_pass.delay),
                },
            );
            routes.insert(
                format!("{}-path2", conn.id),
                ActiveRoute {
                    source,
                    target: RouteTarget::Node(all_pass.feedback),
                },
            );
        } else if let Some(input) = resolve_input(backend, dest) {
            routes.insert(
                conn.id.clone(),
                ActiveRoute {
                    source,
                    target: RouteTarget::Node(input),
                },
            );
        } else {
            log::debug!("route '{}': no live destination for '{}'", conn.id, dest);
        }
    }

    routes
}

/// Both endpoints exist and both declared ports are audio.
///
/// Control-rate edges travel through the logic engine's output cache,
/// never through the audio graph.
fn is_audio_edge(store: &dyn GraphStore, conn: &Connection) -> bool {
    let port_type = |instance_id: &str, port_id: &str, input: bool| {
        let instance = store.instance(instance_id)?;
        let spec = store.specification(instance)?;
        let port = if input {
            spec.find_input(port_id)
        } else {
            spec.find_output(port_id)
        };
        port.map(|p| p.port_type)
    };

    port_type(&conn.from_instance_id, &conn.from_output_id, false) == Some(PortType::Audio)
        && port_type(&conn.to_instance_id, &conn.to_input_id, true) == Some(PortType::Audio)
}

fn resolve_source(backend: &dyn AudioBackend, instance_id: &str) -> Option<NodeHandle> {
    RegistryKind::ALL
        .iter()
        .find_map(|&kind| backend.registry(kind)?.output(instance_id))
}

fn resolve_input(backend: &dyn AudioBackend, instance_id: &str) -> Option<NodeHandle> {
    RegistryKind::ALL
        .iter()
        .find_map(|&kind| backend.registry(kind)?.input(instance_id))
}

fn resolve_all_pass(backend: &dyn AudioBackend, instance_id: &str) -> Option<AllPassNodes> {
    RegistryKind::ALL
        .iter()
        .find_map(|&kind| backend.registry(kind)?.all_pass(instance_id))
}

/// Named parameter on the destination: custom unit, then native node, then
/// the all-pass delay-time and feedback-gain parameters.
fn resolve_param(backend: &dyn AudioBackend, instance_id: &str, name: &str) -> Option<ParamHandle> {
    [RegistryKind::CustomUnit, RegistryKind::Native]
        .iter()
        .find_map(|&kind| backend.registry(kind)?.param(instance_id, name))
        .or_else(|| {
            let all_pass = resolve_all_pass(backend, instance_id)?;
            match name {
                ALL_PASS_DELAY_PARAM => Some(all_pass.delay_time),
                ALL_PASS_FEEDBACK_PARAM => Some(all_pass.feedback_gain),
                _ => None,
            }
        })
}
