//! Change notification: triggers, callbacks, and the shared ticker.
//!
//! Every subscription owns a capacity-1 cause mailbox. Transactions
//! `try_send` into it when a watched table is dirtied, so a burst of
//! writes collapses into a single wakeup (at-least-once, at-most-
//! coalesced). A shared one-second ticker feeds `Timer` causes to
//! subscriptions that asked for a period, and external channels can be
//! bound to a callback to inject `External` causes.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::debug;

use crate::db::{lock, Conn};
use crate::tables::{TableKind, TableSet};

/// Why a callback or trigger fired. Bodies read this only for logging;
/// current state must always be re-read from the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    /// One of the watched tables changed.
    Change(TableKind),
    /// The subscription's tick period elapsed.
    Timer,
    /// A bound external channel fired.
    External,
}

pub(crate) struct TickEntry {
    pub(crate) secs: u64,
    pub(crate) tx: mpsc::Sender<Cause>,
}

/// A subscription consumed directly by a control loop's `select!`.
pub struct Trigger {
    rx: mpsc::Receiver<Cause>,
}

impl Trigger {
    /// Wait for the next cause. Returns `None` only if the database went
    /// away entirely.
    pub async fn recv(&mut self) -> Option<Cause> {
        self.rx.recv().await
    }

    /// Non-blocking poll of the mailbox.
    pub fn try_recv(&mut self) -> Option<Cause> {
        self.rx.try_recv().ok()
    }
}

/// A registered reaction to table changes and timers. Each registration
/// gets one serial consumer task: at most one body instance runs at a
/// time, concurrently with other callbacks.
#[async_trait]
pub trait Callback: Send + 'static {
    async fn on_cause(&mut self, cause: Cause);
}

/// Handle returned by [`Conn::register_callback`], used to bind external
/// trigger channels.
pub struct CallbackHandle {
    tx: mpsc::Sender<Cause>,
}

impl CallbackHandle {
    /// Forward each signal on `signals` into this callback's mailbox.
    pub fn bind_trigger(&self, mut signals: mpsc::Receiver<()>) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            while signals.recv().await.is_some() {
                let _ = tx.try_send(Cause::External);
            }
        });
    }
}

impl Conn {
    /// Subscribe to changes of the given tables.
    pub fn trigger(&self, tables: TableSet) -> Trigger {
        let (tx, rx) = mpsc::channel(1);
        self.db.add_watcher(tables, &tx);
        Trigger { rx }
    }

    /// Subscribe to changes of the given tables and a periodic tick.
    /// Requires a tokio runtime.
    pub fn trigger_tick(&self, secs: u64, tables: TableSet) -> Trigger {
        let (tx, rx) = mpsc::channel(1);
        self.db.add_watcher(tables, &tx);
        self.add_tick(secs, tx);
        Trigger { rx }
    }

    /// Register a callback on the given tables with an optional tick
    /// period (0 disables the timer). Spawns the callback's serial
    /// consumer task; requires a tokio runtime.
    pub fn register_callback(
        &self,
        name: impl Into<String>,
        secs: u64,
        tables: TableSet,
        mut callback: impl Callback,
    ) -> CallbackHandle {
        let (tx, mut rx) = mpsc::channel(1);
        self.db.add_watcher(tables, &tx);
        if secs > 0 {
            self.add_tick(secs, tx.clone());
        }

        let name = name.into();
        tokio::spawn(async move {
            while let Some(cause) = rx.recv().await {
                debug!(callback = %name, ?cause, "entering callback");
                let start = Instant::now();
                callback.on_cause(cause).await;
                debug!(callback = %name, elapsed = ?start.elapsed(), "exiting callback");
            }
        });

        CallbackHandle { tx }
    }

    fn add_tick(&self, secs: u64, tx: mpsc::Sender<Cause>) {
        lock(&self.db.ticks).push(TickEntry {
            secs: secs.max(1),
            tx,
        });
        self.ensure_ticker();
    }

    /// Start the shared one-second ticker the first time someone needs it.
    fn ensure_ticker(&self) {
        if self.db.ticker_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let db = Arc::downgrade(&self.db);
        tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_secs(1));
            interval.tick().await; // the first tick is immediate
            let mut elapsed: u64 = 0;
            loop {
                interval.tick().await;
                elapsed += 1;
                let Some(db) = db.upgrade() else { break };
                lock(&db.ticks).retain(|entry| {
                    if elapsed % entry.secs == 0 {
                        !matches!(
                            entry.tx.try_send(Cause::Timer),
                            Err(mpsc::error::TrySendError::Closed(_))
                        )
                    } else {
                        !entry.tx.is_closed()
                    }
                });
            }
        });
    }
}
