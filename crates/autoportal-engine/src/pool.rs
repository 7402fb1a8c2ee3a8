//! Bounded session pool.
//!
//! Enforces a hard cap on concurrently live engine contexts. Demand beyond
//! the cap is queued strictly FIFO with a bounded wait; spare contexts are
//! pre-warmed so the common acquire is O(1). Sessions are single-use per
//! checkout: they are closed on release, never recycled, so no state leaks
//! between callers.
//!
//! When the engine reports an unexpected disconnect the pool drops
//! everything it thought was live and relaunches the engine on the next
//! acquire. In-flight sessions from before the disconnect are presumed
//! invalid; their release is a no-op on the books.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{AutomationEngine, ContextHandle};
use crate::error::PoolError;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard cap on live contexts (active + spare + warming).
    pub max_concurrent: usize,
    /// Spare contexts kept warm for O(1) checkout.
    pub spare_target: usize,
    /// How long an acquire may wait in the queue before failing.
    pub wait_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 15,
            spare_target: 2,
            wait_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Warming,
    IdleSpare,
    Active,
    Closing,
}

/// One isolated engine context checked out to exactly one caller.
#[derive(Debug, Clone)]
pub struct PooledSession {
    pub id: Uuid,
    pub context: ContextHandle,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
}

impl PooledSession {
    fn warming(context: ContextHandle) -> Self {
        Self {
            id: Uuid::new_v4(),
            context,
            created_at: Utc::now(),
            state: SessionState::Warming,
        }
    }
}

struct WaitTicket {
    enqueued_at: Instant,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct PoolState {
    launched: bool,
    terminal: bool,
    active: HashMap<Uuid, PooledSession>,
    /// Slots granted to callers that are still creating their context.
    reserved: usize,
    /// Contexts whose close is still in flight; they remain live at the
    /// engine and must keep counting against the cap.
    closing: usize,
    spares: VecDeque<PooledSession>,
    waiters: VecDeque<WaitTicket>,
}

impl PoolState {
    fn live(&self) -> usize {
        self.active.len() + self.reserved + self.closing + self.spares.len()
    }
}

pub struct SessionPool {
    engine: Arc<dyn AutomationEngine>,
    config: PoolConfig,
    state: Arc<Mutex<PoolState>>,
    disconnects: watch::Receiver<bool>,
}

impl SessionPool {
    pub fn new(engine: Arc<dyn AutomationEngine>, config: PoolConfig) -> Self {
        let disconnects = engine.disconnect_signal();
        Self {
            engine,
            config,
            state: Arc::new(Mutex::new(PoolState::default())),
            disconnects,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Launch the engine (if needed) and start filling the spare pool.
    pub async fn warm_up(&self) -> Result<(), PoolError> {
        {
            let mut state = self.state.lock().await;
            if state.terminal {
                return Err(PoolError::ShutDown);
            }
            if !state.launched {
                self.engine
                    .launch()
                    .await
                    .map_err(|error| self.engine_failure(error))?;
                state.launched = true;
            }
        }
        self.top_up_spares();
        Ok(())
    }

    /// Check out one session.
    ///
    /// Hands out an idle spare when one exists, creates a context while
    /// under the cap, and otherwise queues behind earlier callers for at
    /// most the configured wait timeout.
    pub async fn acquire(&self) -> Result<PooledSession, PoolError> {
        let mut state = self.state.lock().await;
        if state.terminal {
            return Err(PoolError::ShutDown);
        }

        // Engine died since the last launch: everything we thought was
        // live is gone. Reset the books and relaunch below.
        if state.launched && *self.disconnects.borrow() {
            warn!(
                dropped_active = state.active.len(),
                dropped_spares = state.spares.len(),
                "automation engine disconnected, invalidating pool"
            );
            state.launched = false;
            state.spares.clear();
            state.active.clear();
            self.grant_next_locked(&mut state);
        }

        if !state.launched {
            self.engine
                .launch()
                .await
                .map_err(|error| self.engine_failure(error))?;
            state.launched = true;
            info!("automation engine launched");
        }

        if let Some(mut spare) = state.spares.pop_front() {
            spare.state = SessionState::Active;
            state.active.insert(spare.id, spare.clone());
            drop(state);
            self.top_up_spares();
            return Ok(spare);
        }

        if state.live() < self.config.max_concurrent {
            state.reserved += 1;
            drop(state);
            return self.create_active_session().await;
        }

        let (tx, mut rx) = oneshot::channel();
        state.waiters.push_back(WaitTicket {
            enqueued_at: Instant::now(),
            tx,
        });
        let queue_depth = state.waiters.len();
        drop(state);
        debug!(queue_depth, "session pool at capacity, queueing");

        match timeout(self.config.wait_timeout, &mut rx).await {
            // The releaser reserved a slot for us before waking us up.
            Ok(Ok(())) => self.create_active_session().await,
            Ok(Err(_)) => Err(PoolError::ShutDown),
            Err(_) => {
                // A grant may have landed right as the deadline fired.
                // Refuse any further grant, and if one already arrived
                // give its reserved slot back to the queue.
                rx.close();
                if rx.try_recv().is_ok() {
                    let mut state = self.state.lock().await;
                    state.reserved -= 1;
                    self.grant_next_locked(&mut state);
                }
                Err(PoolError::Exhausted(self.config.wait_timeout))
            }
        }
    }

    /// Close a session and hand its slot to the longest-waiting caller.
    ///
    /// Releasing an unknown (or already-released) session is a no-op, so
    /// capacity accounting can never go negative.
    pub async fn release(&self, session: &PooledSession) {
        let removed = {
            let mut state = self.state.lock().await;
            let removed = state.active.remove(&session.id);
            if removed.is_some() {
                // The context is still open at the engine until the close
                // below finishes; keep its slot counted so nobody can
                // overshoot the cap in the meantime.
                state.closing += 1;
            }
            removed
        };
        let Some(mut closing) = removed else {
            debug!(session = %session.id, "release of unknown or already-released session");
            return;
        };
        closing.state = SessionState::Closing;

        if let Err(error) = self.engine.close_context(&closing.context).await {
            warn!(session = %closing.id, error = %error, "context close failed on release");
        }

        let mut state = self.state.lock().await;
        state.closing -= 1;
        self.grant_next_locked(&mut state);
    }

    /// Close everything, reject queued waiters, and refuse further work.
    /// Close errors are collected and logged, never surfaced.
    pub async fn shutdown(&self) {
        let (spares, active, waiters) = {
            let mut state = self.state.lock().await;
            if state.terminal {
                return;
            }
            state.terminal = true;
            (
                std::mem::take(&mut state.spares),
                std::mem::take(&mut state.active),
                std::mem::take(&mut state.waiters),
            )
        };
        // Dropping the tickets' senders fails pending acquires fast.
        drop(waiters);

        let contexts: Vec<ContextHandle> = spares
            .iter()
            .map(|s| s.context.clone())
            .chain(active.values().map(|s| s.context.clone()))
            .collect();
        let closes = contexts.iter().map(|ctx| self.engine.close_context(ctx));
        let failures = futures::future::join_all(closes)
            .await
            .into_iter()
            .filter(|outcome| outcome.is_err())
            .count();
        if failures > 0 {
            warn!(failures, "some contexts failed to close during shutdown");
        }

        if let Err(error) = self.engine.close().await {
            warn!(error = %error, "engine close failed during shutdown");
        }
        info!("session pool shut down");
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }

    pub async fn spare_count(&self) -> usize {
        self.state.lock().await.spares.len()
    }

    pub async fn waiting_count(&self) -> usize {
        self.state.lock().await.waiters.len()
    }

    /// Serve waiters in FIFO order while capacity remains. Tickets whose
    /// caller already timed out are skipped.
    fn grant_next_locked(&self, state: &mut PoolState) {
        while state.live() < self.config.max_concurrent {
            let Some(ticket) = state.waiters.pop_front() else {
                break;
            };
            let waited_ms = ticket.enqueued_at.elapsed().as_millis() as u64;
            if ticket.tx.send(()).is_ok() {
                state.reserved += 1;
                debug!(waited_ms, "wait ticket served");
            }
        }
    }

    /// Create a context for a caller that already holds a reserved slot.
    async fn create_active_session(&self) -> Result<PooledSession, PoolError> {
        match self.engine.create_context().await {
            Ok(context) => {
                let mut session = PooledSession::warming(context.clone());
                session.state = SessionState::Active;

                let mut state = self.state.lock().await;
                state.reserved -= 1;
                if state.terminal {
                    drop(state);
                    let _ = self.engine.close_context(&context).await;
                    return Err(PoolError::ShutDown);
                }
                state.active.insert(session.id, session.clone());
                Ok(session)
            }
            Err(error) => {
                let mut state = self.state.lock().await;
                state.reserved -= 1;
                self.grant_next_locked(&mut state);
                drop(state);
                Err(self.engine_failure(error))
            }
        }
    }

    /// Engine failures while the disconnect flag is raised are the
    /// disconnect, not an independent fault.
    fn engine_failure(&self, error: anyhow::Error) -> PoolError {
        if *self.disconnects.borrow() {
            PoolError::Disconnected
        } else {
            PoolError::Engine(error)
        }
    }

    /// Asynchronously refill the spare pool up to its target, respecting
    /// the overall cap.
    fn top_up_spares(&self) {
        let engine = self.engine.clone();
        let state = self.state.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            loop {
                {
                    let mut s = state.lock().await;
                    let wanted = !s.terminal
                        && s.launched
                        && s.spares.len() < config.spare_target
                        && s.live() < config.max_concurrent;
                    if !wanted {
                        return;
                    }
                    s.reserved += 1;
                }

                match engine.create_context().await {
                    Ok(context) => {
                        let mut s = state.lock().await;
                        s.reserved -= 1;
                        let still_wanted = !s.terminal
                            && s.launched
                            && s.spares.len() < config.spare_target
                            && s.live() < config.max_concurrent;
                        if still_wanted {
                            let mut spare = PooledSession::warming(context);
                            spare.state = SessionState::IdleSpare;
                            s.spares.push_back(spare);
                        } else {
                            drop(s);
                            let _ = engine.close_context(&context).await;
                            return;
                        }
                    }
                    Err(error) => {
                        let mut s = state.lock().await;
                        s.reserved -= 1;
                        drop(s);
                        warn!(error = %error, "failed to pre-warm spare session");
                        return;
                    }
                }
            }
        });
    }
}
