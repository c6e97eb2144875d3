//! Reconciliation loop.
//!
//! Triggers are debounced into resolver passes by a small state machine
//! ([`ReconcileMachine`]) that a single driver task feeds with trigger, timer
//! and completion inputs. At most one pass runs at a time; triggers that arrive
//! while a pass runs arm one trailing pass, so any burst costs at most two.
//!
//! A pass:
//! 1. waits (bounded) for an in-flight permission load to settle
//! 2. snapshots `(registry, permissions, authenticated)`
//! 3. resolves and commits the new [`ActivationState`]
//! 4. emits one `module_change` per changed module, then one `state_change`

use std::future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

use modgate_auth::{PermissionSet, Session};
use modgate_core::{EngineError, EngineResult};
use modgate_events::{Event, EventBus};
use modgate_registry::ModuleRegistry;

use crate::payloads::{ModuleChanged, RECONCILER_SOURCE, StateChanged};
use crate::permission_store::PermissionStore;
use crate::resolver::{ActivationState, resolve};

/// Why a reconciliation was requested. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    AuthChanged,
    PermissionsLoaded,
    RegistryRefreshed,
    Manual,
}

/// Trailing-pass state while a pass is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trailing {
    None,
    /// A trigger arrived; the trailing debounce ends at `deadline`.
    Pending { deadline: Instant },
    /// The trailing debounce elapsed; run as soon as the current pass ends.
    Due,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Scheduled { deadline: Instant },
    Running { generation: u64, trailing: Trailing },
}

/// Debounce and mutual exclusion of passes, without any IO or timers.
#[derive(Debug, Clone)]
pub struct ReconcileMachine {
    phase: Phase,
    debounce: Duration,
    generation: u64,
}

impl ReconcileMachine {
    pub fn new(debounce: Duration) -> Self {
        Self {
            phase: Phase::Idle,
            debounce,
            generation: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Generation of the most recently started pass (0 before the first).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn on_trigger(&mut self, now: Instant) {
        let deadline = now + self.debounce;
        self.phase = match self.phase {
            Phase::Idle | Phase::Scheduled { .. } => Phase::Scheduled { deadline },
            Phase::Running {
                generation,
                trailing: Trailing::Due,
            } => Phase::Running {
                generation,
                trailing: Trailing::Due,
            },
            Phase::Running { generation, .. } => Phase::Running {
                generation,
                trailing: Trailing::Pending { deadline },
            },
        };
    }

    /// Skip the debounce.
    pub fn on_flush(&mut self, now: Instant) {
        self.phase = match self.phase {
            Phase::Idle | Phase::Scheduled { .. } => Phase::Scheduled { deadline: now },
            Phase::Running { generation, .. } => Phase::Running {
                generation,
                trailing: Trailing::Due,
            },
        };
    }

    /// When the driver has to wake up next, if at all.
    pub fn deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Scheduled { deadline } => Some(deadline),
            Phase::Running {
                trailing: Trailing::Pending { deadline },
                ..
            } => Some(deadline),
            _ => None,
        }
    }

    /// Timer input. Returns the generation of the pass to start, if any.
    pub fn on_deadline(&mut self, now: Instant) -> Option<u64> {
        match self.phase {
            Phase::Scheduled { deadline } if now >= deadline => {
                self.generation += 1;
                self.phase = Phase::Running {
                    generation: self.generation,
                    trailing: Trailing::None,
                };
                Some(self.generation)
            }
            Phase::Running {
                generation,
                trailing: Trailing::Pending { deadline },
            } if now >= deadline => {
                self.phase = Phase::Running {
                    generation,
                    trailing: Trailing::Due,
                };
                None
            }
            _ => None,
        }
    }

    /// Completion input.
    pub fn on_pass_complete(&mut self, now: Instant) {
        self.phase = match self.phase {
            Phase::Running { trailing, .. } => match trailing {
                Trailing::None => Phase::Idle,
                Trailing::Pending { deadline } => Phase::Scheduled { deadline },
                Trailing::Due => Phase::Scheduled { deadline: now },
            },
            other => other,
        };
    }
}

/// What a pass reads. Every field is a snapshot source; nothing here is
/// mutated by the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcileInputs {
    pub registry: watch::Receiver<ModuleRegistry>,
    pub session: watch::Receiver<Option<Session>>,
    pub permissions: PermissionStore,
    pub bus: EventBus,
    pub settle_timeout: Duration,
}

struct PassContext {
    inputs: ReconcileInputs,
    activation: watch::Sender<ActivationState>,
    passes: Arc<AtomicU64>,
}

enum Command {
    Trigger(Trigger),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running reconciler. Clones share the same driver task.
#[derive(Debug, Clone)]
pub struct ReconcilerHandle {
    commands: mpsc::UnboundedSender<Command>,
    activation: watch::Receiver<ActivationState>,
    passes: Arc<AtomicU64>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Trigger(trigger) => f.debug_tuple("Trigger").field(trigger).finish(),
            Command::Flush(_) => f.write_str("Flush"),
            Command::Shutdown(_) => f.write_str("Shutdown"),
        }
    }
}

/// Start the driver task.
///
/// The initial activation is the anonymous resolution of the current registry;
/// it is committed without emitting events.
pub fn spawn(inputs: ReconcileInputs, debounce: Duration) -> ReconcilerHandle {
    let initial = resolve(&inputs.registry.borrow(), &PermissionSet::empty(), false);
    let (activation, activation_rx) = watch::channel(initial);
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let passes = Arc::new(AtomicU64::new(0));

    let ctx = Arc::new(PassContext {
        inputs,
        activation,
        passes: passes.clone(),
    });
    tokio::spawn(drive(ReconcileMachine::new(debounce), ctx, commands_rx));

    ReconcilerHandle {
        commands,
        activation: activation_rx,
        passes,
    }
}

impl ReconcilerHandle {
    pub fn trigger(&self, trigger: Trigger) -> EngineResult<()> {
        self.commands
            .send(Command::Trigger(trigger))
            .map_err(|_| EngineError::ShutDown)
    }

    /// Run a pass without waiting for the debounce and wait for it to finish.
    pub async fn flush(&self) -> EngineResult<()> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Flush(ack))
            .map_err(|_| EngineError::ShutDown)?;
        done.await.map_err(|_| EngineError::ShutDown)
    }

    /// Stop the driver. A pass already running completes first.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Completed passes.
    pub fn pass_count(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    pub fn activation(&self) -> ActivationState {
        self.activation.borrow().clone()
    }

    pub fn activation_watch(&self) -> watch::Receiver<ActivationState> {
        self.activation.clone()
    }
}

async fn drive(
    mut machine: ReconcileMachine,
    ctx: Arc<PassContext>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut running: Option<JoinHandle<()>> = None;
    // Flush callers waiting for the next pass to start, and for the current
    // one to finish.
    let mut queued: Vec<oneshot::Sender<()>> = Vec::new();
    let mut in_pass: Vec<oneshot::Sender<()>> = Vec::new();

    tracing::debug!("reconciler started");

    loop {
        let deadline = machine.deadline();

        tokio::select! {
            biased;

            command = commands.recv() => match command {
                Some(Command::Trigger(trigger)) => {
                    tracing::debug!(?trigger, "reconcile triggered");
                    machine.on_trigger(Instant::now());
                }
                Some(Command::Flush(ack)) => {
                    queued.push(ack);
                    machine.on_flush(Instant::now());
                }
                Some(Command::Shutdown(ack)) => {
                    finish(running.take(), &mut in_pass).await;
                    let _ = ack.send(());
                    break;
                }
                None => {
                    finish(running.take(), &mut in_pass).await;
                    break;
                }
            },

            outcome = join_pass(&mut running) => {
                if let Err(err) = outcome {
                    tracing::error!(error = %err, "reconciliation pass aborted");
                }
                machine.on_pass_complete(Instant::now());
                for waiter in in_pass.drain(..) {
                    let _ = waiter.send(());
                }
            },

            () = wait_until(deadline) => {
                if let Some(generation) = machine.on_deadline(Instant::now()) {
                    in_pass.append(&mut queued);
                    running = Some(tokio::spawn(run_pass(ctx.clone(), generation)));
                }
            },
        }
    }

    tracing::debug!(passes = ctx.passes.load(Ordering::SeqCst), "reconciler stopped");
}

async fn finish(running: Option<JoinHandle<()>>, waiters: &mut Vec<oneshot::Sender<()>>) {
    if let Some(handle) = running {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "reconciliation pass aborted");
        }
    }
    for waiter in waiters.drain(..) {
        let _ = waiter.send(());
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

async fn join_pass(running: &mut Option<JoinHandle<()>>) -> Result<(), JoinError> {
    match running {
        Some(handle) => {
            let outcome = handle.await;
            *running = None;
            outcome
        }
        None => future::pending().await,
    }
}

async fn run_pass(ctx: Arc<PassContext>, generation: u64) {
    let inputs = &ctx.inputs;
    inputs.permissions.settled(inputs.settle_timeout).await;

    let registry = inputs.registry.borrow().clone();
    let user_id = inputs.session.borrow().as_ref().map(Session::user_id);
    let authenticated = user_id.is_some();
    // A set loaded for anyone but the current user never reaches the resolver.
    let permissions = match user_id {
        Some(user_id) => inputs.permissions.permissions_for(user_id),
        None => PermissionSet::empty(),
    };

    let next = resolve(&registry, &permissions, authenticated);
    let previous = ctx.activation.send_replace(next.clone());
    let changes = next.diff(&previous, &registry);

    tracing::debug!(
        generation,
        authenticated,
        permissions = permissions.len(),
        changed = changes.len(),
        "reconciliation pass"
    );

    for (module_id, enabled) in &changes {
        let payload = ModuleChanged {
            module_id: module_id.clone(),
            enabled: *enabled,
            generation,
        };
        inputs.bus.emit(Event::from_payload(RECONCILER_SOURCE, &payload));
    }

    if !changes.is_empty() {
        let summary = StateChanged {
            generation,
            changed: changes.into_iter().map(|(id, _)| id).collect(),
            enabled: next.enabled_ids().cloned().collect(),
            authenticated,
        };
        tracing::info!(
            generation,
            changed = summary.changed.len(),
            enabled = summary.enabled.len(),
            "activation changed"
        );
        inputs.bus.emit(Event::from_payload(RECONCILER_SOURCE, &summary));
    }

    ctx.passes.fetch_add(1, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEBOUNCE: Duration = Duration::from_millis(300);

    fn ms(start: Instant, millis: u64) -> Instant {
        start + Duration::from_millis(millis)
    }

    #[test]
    fn triggers_while_scheduled_coalesce() {
        let t0 = Instant::now();
        let mut machine = ReconcileMachine::new(DEBOUNCE);

        machine.on_trigger(t0);
        machine.on_trigger(ms(t0, 50));
        machine.on_trigger(ms(t0, 100));

        assert_eq!(machine.deadline(), Some(ms(t0, 400)));
        assert_eq!(machine.on_deadline(ms(t0, 300)), None);
        assert_eq!(machine.on_deadline(ms(t0, 400)), Some(1));
        assert_eq!(machine.deadline(), None);

        machine.on_pass_complete(ms(t0, 410));
        assert_eq!(machine.phase(), Phase::Idle);
    }

    #[test]
    fn trigger_while_running_arms_one_trailing_pass() {
        let t0 = Instant::now();
        let mut machine = ReconcileMachine::new(DEBOUNCE);

        machine.on_trigger(t0);
        assert_eq!(machine.on_deadline(ms(t0, 300)), Some(1));

        machine.on_trigger(ms(t0, 350));
        machine.on_trigger(ms(t0, 360));
        assert_eq!(machine.deadline(), Some(ms(t0, 660)));

        // Timer fires while still running: the trailing pass becomes due.
        assert_eq!(machine.on_deadline(ms(t0, 660)), None);
        assert_eq!(
            machine.phase(),
            Phase::Running {
                generation: 1,
                trailing: Trailing::Due
            }
        );
        machine.on_trigger(ms(t0, 700));
        assert_eq!(machine.deadline(), None);

        machine.on_pass_complete(ms(t0, 900));
        assert_eq!(machine.deadline(), Some(ms(t0, 900)));
        assert_eq!(machine.on_deadline(ms(t0, 900)), Some(2));

        machine.on_pass_complete(ms(t0, 950));
        assert_eq!(machine.phase(), Phase::Idle);
    }

    #[test]
    fn pending_trailing_keeps_its_own_deadline_after_completion() {
        let t0 = Instant::now();
        let mut machine = ReconcileMachine::new(DEBOUNCE);

        machine.on_trigger(t0);
        machine.on_deadline(ms(t0, 300));
        machine.on_trigger(ms(t0, 320));
        machine.on_pass_complete(ms(t0, 330));

        assert_eq!(machine.phase(), Phase::Scheduled { deadline: ms(t0, 620) });
    }

    #[test]
    fn flush_skips_the_debounce() {
        let t0 = Instant::now();
        let mut machine = ReconcileMachine::new(DEBOUNCE);

        machine.on_trigger(t0);
        machine.on_flush(ms(t0, 10));
        assert_eq!(machine.on_deadline(ms(t0, 10)), Some(1));

        machine.on_flush(ms(t0, 20));
        assert_eq!(
            machine.phase(),
            Phase::Running {
                generation: 1,
                trailing: Trailing::Due
            }
        );
    }

    #[test]
    fn completion_while_idle_is_ignored() {
        let mut machine = ReconcileMachine::new(DEBOUNCE);
        machine.on_pass_complete(Instant::now());
        assert_eq!(machine.phase(), Phase::Idle);
        assert_eq!(machine.generation(), 0);
    }
}
