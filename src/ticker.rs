//! Thread-hosted logic loop.
//!
//! The ticker thread owns the [`Runtime`] outright. The UI side holds a
//! [`SessionHandle`] and talks to it over MPSC channels: commands go in,
//! exactly one [`CommandResult`] per command comes back, in order.
//!
//! Commands are applied between ticks, never during one, so a tick always
//! sees a consistent graph.
//!
//! ```ignore
//! let mut runtime = Runtime::new(EngineConfig::default(), patch);
//! runtime.attach_backend(backend);
//! let mut session = ticker::spawn(runtime)?;
//!
//! session.send(Command::SetAudioEnabled { enabled: true });
//! let snapshot = session.request(Command::Snapshot, Duration::from_millis(100));
//! ```

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::backend::AudioBackend;
use crate::runtime::Runtime;
use crate::state::{Command, CommandResult};

const THREAD_NAME: &str = "blockgraph-ticker";

/// Move `runtime` onto a new ticker thread.
pub fn spawn<B>(runtime: Runtime<B>) -> std::io::Result<SessionHandle>
where
    B: AudioBackend + Send + 'static,
{
    let (command_tx, command_rx) = mpsc::channel();
    let (result_tx, result_rx) = mpsc::channel();

    let worker = thread::Builder::new()
        .name(THREAD_NAME.to_string())
        .spawn(move || run(runtime, command_rx, result_tx))?;

    Ok(SessionHandle {
        command_tx: Some(command_tx),
        result_rx,
        worker: Some(worker),
        outstanding: 0,
    })
}

// ═══════════════════════════════════════════════════════════════════
// Ticker thread
// ═══════════════════════════════════════════════════════════════════

fn run<B: AudioBackend>(
    mut runtime: Runtime<B>,
    command_rx: Receiver<Command>,
    result_tx: Sender<CommandResult>,
) {
    let mut next_tick = Instant::now();
    let mut was_running = runtime.is_running();

    loop {
        let received = if runtime.is_running() {
            let timeout = next_tick.saturating_duration_since(Instant::now());
            match command_rx.recv_timeout(timeout) {
                Ok(command) => Some(command),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        } else {
            // Idle: nothing to do until the next command
            match command_rx.recv() {
                Ok(command) => Some(command),
                Err(_) => break,
            }
        };

        match received {
            Some(Command::Shutdown) => {
                let _ = result_tx.send(runtime.apply(Command::Shutdown));
                log::debug!("ticker shut down");
                return;
            }
            Some(command) => {
                let _ = result_tx.send(runtime.apply(command));
            }
            None => {
                runtime.tick();
                let period = runtime.tick_period();
                next_tick += period;
                let now = Instant::now();
                if next_tick < now {
                    // Overran: drop the missed ticks instead of bursting
                    next_tick = now + period;
                }
            }
        }

        let running = runtime.is_running();
        if running && !was_running {
            next_tick = Instant::now();
        }
        was_running = running;
    }

    // Every handle is gone
    runtime.apply(Command::Shutdown);
    log::debug!("ticker channel closed");
}

// ═══════════════════════════════════════════════════════════════════
// SessionHandle - UI side
// ═══════════════════════════════════════════════════════════════════

/// UI-side handle to a running ticker. Dropping it shuts the ticker down.
pub struct SessionHandle {
    command_tx: Option<Sender<Command>>,
    result_rx: Receiver<CommandResult>,
    worker: Option<JoinHandle<()>>,

    /// Commands sent whose result has not been received yet.
    outstanding: usize,
}

impl SessionHandle {
    /// Queue a command. Returns `false` once the ticker has stopped.
    pub fn send(&mut self, command: Command) -> bool {
        let sent = self
            .command_tx
            .as_ref()
            .is_some_and(|tx| tx.send(command).is_ok());
        if sent {
            self.outstanding += 1;
        }
        sent
    }

    /// Drain every result that has arrived so far.
    pub fn poll_results(&mut self) -> Vec<CommandResult> {
        let mut results = Vec::new();
        loop {
            match self.result_rx.try_recv() {
                Ok(result) => {
                    self.outstanding = self.outstanding.saturating_sub(1);
                    results.push(result);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
        results
    }

    /// Block for the next result.
    pub fn wait_result(&mut self, timeout: Duration) -> Option<CommandResult> {
        let result = self.result_rx.recv_timeout(timeout).ok()?;
        self.outstanding = self.outstanding.saturating_sub(1);
        Some(result)
    }

    /// Send a command and wait for its own result. Results of earlier
    /// commands that arrive first are discarded.
    pub fn request(&mut self, command: Command, timeout: Duration) -> Option<CommandResult> {
        if !self.send(command) {
            return None;
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let result = self.wait_result(remaining)?;
            if self.outstanding == 0 {
                return Some(result);
            }
        }
    }

    /// Stop the ticker and wait for it to release the backend.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(Command::Shutdown);
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("{} thread panicked", THREAD_NAME);
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::EngineConfig;
    use crate::state::{BlockInstance, BlockSpec, Patch, PortSpec, PortType, SpecRegistry};
    use crate::value::Value;

    const WAIT: Duration = Duration::from_secs(2);

    fn runtime() -> Runtime<MemoryBackend> {
        let mut specs = SpecRegistry::new();
        specs.register(
            BlockSpec::new("source", "Source")
                .with_output(PortSpec::new("outA", PortType::Number))
                .with_logic(r#"output("outA", 10);"#),
        );
        specs.register(
            BlockSpec::new("doubler", "Doubler")
                .with_input(PortSpec::new("inB", PortType::Number))
                .with_output(PortSpec::new("outB", PortType::Number))
                .with_logic(r#"output("outB", inputs.inB * 2);"#),
        );

        let mut patch = Patch::new(specs);
        patch.create_instance("A", "source").unwrap();
        patch.create_instance("B", "doubler").unwrap();
        patch.connect("A", "outA", "B", "inB").unwrap();

        let mut runtime = Runtime::new(EngineConfig::default(), patch);
        runtime.attach_backend(MemoryBackend::default());
        runtime
    }

    fn b_output(instances: &[BlockInstance]) -> Option<Value> {
        instances
            .iter()
            .find(|i| i.id == "B")?
            .last_outputs
            .get("outB")
            .cloned()
    }

    #[test]
    fn test_snapshot_while_idle() {
        let mut session = spawn(runtime()).unwrap();
        match session.request(Command::Snapshot, WAIT) {
            Some(CommandResult::Snapshot { instances }) => {
                assert_eq!(instances.len(), 2);
                assert_eq!(b_output(&instances), None);
            }
            other => panic!("unexpected result {:?}", other),
        }
        session.shutdown();
    }

    #[test]
    fn test_ticks_once_enabled() {
        let mut session = spawn(runtime()).unwrap();
        assert!(matches!(
            session.request(Command::SetAudioEnabled { enabled: true }, WAIT),
            Some(CommandResult::Ok)
        ));

        let deadline = Instant::now() + WAIT;
        let mut seen = None;
        while Instant::now() < deadline {
            if let Some(CommandResult::Snapshot { instances }) =
                session.request(Command::Snapshot, WAIT)
            {
                seen = b_output(&instances);
                if seen.is_some() {
                    break;
                }
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(seen, Some(Value::from(20)));
    }

    #[test]
    fn test_one_result_per_command() {
        let mut session = spawn(runtime()).unwrap();
        session.send(Command::SetTempo { bpm: 90.0 });
        session.send(Command::RemoveInstance {
            instance_id: "missing".into(),
        });
        let last = session.request(Command::Snapshot, WAIT);
        assert!(matches!(last, Some(CommandResult::Snapshot { .. })));
        assert!(session.poll_results().is_empty());
    }

    #[test]
    fn test_send_fails_after_shutdown() {
        let mut session = spawn(runtime()).unwrap();
        session.stop();
        assert!(!session.send(Command::Snapshot));
    }
}
