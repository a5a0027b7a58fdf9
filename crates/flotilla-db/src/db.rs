//! Storage cells, connections, and transactions.
//!
//! The database is a set of typed tables, each behind its own mutex. A
//! transaction declares the tables it touches up front and acquires their
//! locks in one canonical order, so overlapping transactions serialize and
//! disjoint ones run concurrently. There is no rollback: an error returned
//! from a transaction body leaves earlier commits visible, so bodies must
//! not commit partial state on error paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::callback::{Cause, TickEntry};
use crate::error::DbError;
use crate::tables::*;

/// Lock a table cell, surviving a poisoned mutex. A callback that panicked
/// mid-transaction is lost; the tables it held stay usable.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One typed table: rows keyed by ID, a dirty flag raised by writes, and
/// the cause mailboxes to signal when a transaction dirtied it.
pub struct Table<R: Row> {
    pub(crate) rows: BTreeMap<RowId, R>,
    pub(crate) dirty: bool,
    pub(crate) watchers: Vec<mpsc::Sender<Cause>>,
}

impl<R: Row> Default for Table<R> {
    fn default() -> Self {
        Table {
            rows: BTreeMap::new(),
            dirty: false,
            watchers: Vec::new(),
        }
    }
}

/// A database row. Implemented for every table's row type; the storage
/// accessors are wired up by the `tables!` macro below.
pub trait Row: Clone + PartialEq + std::fmt::Debug + Default + Send + Sized + 'static {
    const KIND: TableKind;

    fn id(&self) -> RowId;
    fn set_id(&mut self, id: RowId);

    #[doc(hidden)]
    fn slot<'db, 'v>(view: &'v mut View<'db>) -> &'v mut Option<MutexGuard<'db, Table<Self>>>;
}

macro_rules! tables {
    ($(($kind:ident, $field:ident)),* $(,)?) => {
        /// Process-wide storage: one independently locked cell per table,
        /// plus the shared ID allocator and ticker registry.
        pub struct Database {
            pub(crate) next_id: AtomicU32,
            pub(crate) ticks: Mutex<Vec<TickEntry>>,
            pub(crate) ticker_started: AtomicBool,
            $( pub(crate) $field: Mutex<Table<$kind>>, )*
        }

        impl Database {
            fn new() -> Database {
                Database {
                    next_id: AtomicU32::new(0),
                    ticks: Mutex::new(Vec::new()),
                    ticker_started: AtomicBool::new(false),
                    $( $field: Mutex::new(Table::default()), )*
                }
            }

            /// Register a cause sender with every table in `set`.
            pub(crate) fn add_watcher(&self, set: TableSet, tx: &mpsc::Sender<Cause>) {
                $(
                    if set.contains(TableKind::$kind) {
                        lock(&self.$field).watchers.push(tx.clone());
                    }
                )*
            }
        }

        /// A transaction's window onto its declared tables. Reads and
        /// writes go through here; accessing an undeclared table is a
        /// programming error and panics.
        pub struct View<'a> {
            next_id: &'a AtomicU32,
            $( $field: Option<MutexGuard<'a, Table<$kind>>>, )*
        }

        impl<'a> View<'a> {
            fn acquire(db: &'a Database, set: TableSet) -> View<'a> {
                // Struct literal fields evaluate in declaration order, which
                // is the one canonical lock order that keeps overlapping
                // transactions from deadlocking each other.
                View {
                    next_id: &db.next_id,
                    $( $field: set.contains(TableKind::$kind).then(|| lock(&db.$field)), )*
                }
            }

            /// Signal the watchers of every table this transaction dirtied.
            /// Dirty flags clear before any send; a full mailbox is a no-op.
            fn dispatch(&mut self) {
                $(
                    if let Some(table) = self.$field.as_mut() {
                        if table.dirty {
                            table.dirty = false;
                            table.watchers.retain(|w| {
                                !matches!(
                                    w.try_send(Cause::Change(TableKind::$kind)),
                                    Err(mpsc::error::TrySendError::Closed(_))
                                )
                            });
                        }
                    }
                )*
            }
        }

        $(
            impl Row for $kind {
                const KIND: TableKind = TableKind::$kind;

                fn id(&self) -> RowId {
                    self.id
                }

                fn set_id(&mut self, id: RowId) {
                    self.id = id;
                }

                fn slot<'db, 'v>(
                    view: &'v mut View<'db>,
                ) -> &'v mut Option<MutexGuard<'db, Table<Self>>> {
                    &mut view.$field
                }
            }
        )*
    };
}

tables! {
    (Cluster, cluster),
    (Machine, machine),
    (Container, container),
    (Minion, minion),
    (Connection, connection),
    (Label, label),
    (Etcd, etcd),
    (Placement, placement),
    (AclRule, acl_rule),
    (Image, image),
    (Hostname, hostname),
}

impl<'a> View<'a> {
    fn table<R: Row>(&mut self) -> &mut Table<R> {
        match R::slot(self).as_mut() {
            Some(guard) => &mut **guard,
            None => panic!("transaction has no access to the {} table", R::KIND),
        }
    }

    /// Insert a fresh default row, assigning it a new process-unique ID.
    pub fn insert<R: Row>(&mut self) -> R {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut row = R::default();
        row.set_id(id);
        let table = self.table::<R>();
        table.dirty = true;
        table.rows.insert(id, row.clone());
        row
    }

    /// Overwrite the stored row with the same ID. The table is only marked
    /// dirty when the content actually changed.
    pub fn commit<R: Row>(&mut self, row: R) {
        let table = self.table::<R>();
        match table.rows.get(&row.id()) {
            Some(old) if *old == row => {}
            Some(_) => {
                table.rows.insert(row.id(), row);
                table.dirty = true;
            }
            None => panic!(
                "commit of a row missing from the {} table: {:?}",
                R::KIND,
                row
            ),
        }
    }

    /// Delete a row by ID.
    pub fn remove<R: Row>(&mut self, row: &R) {
        let table = self.table::<R>();
        table.rows.remove(&row.id());
        table.dirty = true;
    }

    /// Rows matching the predicate, cloned out of the table.
    pub fn select<R: Row>(&mut self, pred: impl Fn(&R) -> bool) -> Vec<R> {
        self.table::<R>()
            .rows
            .values()
            .filter(|r| pred(r))
            .cloned()
            .collect()
    }

    /// Every row of the table.
    pub fn rows<R: Row>(&mut self) -> Vec<R> {
        self.select(|_| true)
    }

    /// The minion row describing this node.
    pub fn minion_self(&mut self) -> Result<Minion, DbError> {
        self.select::<Minion>(|m| m.self_node)
            .into_iter()
            .next()
            .ok_or(DbError::NoMinionSelf)
    }

    /// Whether this node currently holds the leader lease.
    pub fn etcd_leader(&mut self) -> bool {
        self.rows::<Etcd>().first().map(|e| e.leader).unwrap_or(false)
    }

    /// The cluster singleton.
    pub fn cluster(&mut self) -> Result<Cluster, DbError> {
        self.rows::<Cluster>()
            .into_iter()
            .next()
            .ok_or(DbError::NoCluster)
    }
}

/// A handle on the database. Cheap to clone; every loop in the process
/// holds one.
#[derive(Clone)]
pub struct Conn {
    pub(crate) db: Arc<Database>,
}

impl Conn {
    pub fn new() -> Conn {
        Conn {
            db: Arc::new(Database::new()),
        }
    }

    /// Run a transaction against the declared tables.
    ///
    /// The body blocks until every declared table is locked. After the body
    /// returns, watchers of each dirtied table are signaled.
    pub fn txn<T>(&self, tables: TableSet, body: impl FnOnce(&mut View) -> T) -> T {
        let mut view = View::acquire(&self.db, tables);
        let out = body(&mut view);
        view.dispatch();
        out
    }

    /// One-shot read of a single table.
    pub fn select<R: Row>(&self, pred: impl Fn(&R) -> bool) -> Vec<R> {
        self.txn(TableSet::of(&[R::KIND]), |view| view.select(pred))
    }

    pub fn minion_self(&self) -> Result<Minion, DbError> {
        self.txn(TableSet::of(&[TableKind::Minion]), |view| view.minion_self())
    }

    pub fn etcd_leader(&self) -> bool {
        self.txn(TableSet::of(&[TableKind::Etcd]), |view| view.etcd_leader())
    }
}

impl Default for Conn {
    fn default() -> Self {
        Conn::new()
    }
}
