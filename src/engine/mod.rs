mod availability;
mod error;
mod ledger;
mod lifecycle;
pub mod pricing;
mod queries;
mod sweeps;

pub use availability::{AvailabilityCheck, check_available, free_windows, merge_overlapping, subtract_windows};
pub use error::{EngineError, ErrorKind, Unavailability};
pub use ledger::{decrement, reconcile, restore};
pub use lifecycle::NoShowOutcome;
pub use sweeps::SweepReport;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::clock::SharedClock;
use crate::config::Policy;
use crate::effects::{Collaborators, Effects};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::occupancy;
use crate::wal::Wal;

pub type SharedBook = Arc<RwLock<ResourceBook>>;
pub type SharedEntitlement = Arc<RwLock<Entitlement>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut pending = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = pending {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        warn!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so a partial batch does not leak into the next one.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// The reservation engine: every resource's book, every entitlement, and the
/// log that makes them durable.
pub struct Engine {
    pub(super) books: DashMap<Ulid, SharedBook>,
    pub(super) entitlements: DashMap<Ulid, SharedEntitlement>,
    /// Reverse lookup: reservation id → resource id.
    pub(super) reservation_index: DashMap<Ulid, Ulid>,
    /// Taken shared by anything that adds a resource or entitlement, and
    /// exclusively by compaction. Always acquired before any book lock.
    pub(super) catalog: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) effects: Effects,
    pub(super) clock: SharedClock,
    pub(super) policy: Policy,
}

/// Apply a committed event to one resource book (caller holds the lock).
fn apply_to_book(book: &mut ResourceBook, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ResourceUpdated {
            name,
            capacity,
            rates,
            bookable,
            ..
        } => {
            book.resource.name = name.clone();
            book.resource.capacity = *capacity;
            book.resource.rates = rates.clone();
            book.resource.bookable = *bookable;
        }
        Event::ResourceStatusChanged { status, .. } => occupancy::apply(book, *status),
        Event::ReservationCreated(reservation) => {
            index.insert(reservation.id, reservation.resource_id);
            book.insert_reservation(reservation.clone());
        }
        Event::ReservationUpdated {
            reservation,
            resource_status,
            ..
        } => {
            if !book.replace_reservation(reservation.clone()) {
                index.insert(reservation.id, reservation.resource_id);
                book.insert_reservation(reservation.clone());
            }
            if let Some(status) = resource_status {
                occupancy::apply(book, *status);
            }
        }
        // Created at the map level; entitlement events never touch a book.
        Event::ResourceCreated(_) | Event::EntitlementSaved(_) | Event::EntitlementRenewed { .. } => {}
    }
}

/// The resource an event belongs to, if any.
fn event_resource_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ResourceCreated(resource) => Some(resource.id),
        Event::ResourceUpdated { id, .. } | Event::ResourceStatusChanged { id, .. } => Some(*id),
        Event::ReservationCreated(reservation) | Event::ReservationUpdated { reservation, .. } => {
            Some(reservation.resource_id)
        }
        Event::EntitlementSaved(_) | Event::EntitlementRenewed { .. } => None,
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        policy: Policy,
        collaborators: Collaborators,
        clock: SharedClock,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            books: DashMap::new(),
            entitlements: DashMap::new(),
            reservation_index: DashMap::new(),
            catalog: RwLock::new(()),
            wal_tx,
            notify: Arc::new(NotifyHub::new()),
            effects: Effects::spawn(collaborators),
            clock,
            policy,
        };

        // We are the sole owner of every lock during replay, so try_write
        // always succeeds. Never block here: this runs inside the runtime.
        for event in &events {
            engine.replay(event);
        }
        tracing::info!(
            events = events.len(),
            resources = engine.books.len(),
            entitlements = engine.entitlements.len(),
            "engine state restored"
        );

        Ok(engine)
    }

    fn replay(&self, event: &Event) {
        match event {
            Event::ResourceCreated(resource) => {
                self.books
                    .entry(resource.id)
                    .or_insert_with(|| Arc::new(RwLock::new(ResourceBook::new(resource.clone()))));
            }
            Event::EntitlementSaved(entitlement) => self.store_entitlement(entitlement),
            Event::EntitlementRenewed { previous, successor } => {
                self.store_entitlement(previous);
                self.store_entitlement(successor);
            }
            other => {
                if let Event::ReservationUpdated {
                    entitlement: Some(entitlement),
                    ..
                } = other
                {
                    self.store_entitlement(entitlement);
                }
                let Some(resource_id) = event_resource_id(other) else { return };
                let Some(book) = self.book(&resource_id) else {
                    warn!(%resource_id, "replay: event for unknown resource skipped");
                    return;
                };
                if let Ok(mut guard) = book.try_write() {
                    apply_to_book(&mut guard, other, &self.reservation_index);
                }
            }
        }
    }

    fn store_entitlement(&self, entitlement: &Entitlement) {
        match self.entitlements.get(&entitlement.id) {
            Some(existing) => {
                if let Ok(mut guard) = existing.try_write() {
                    *guard = entitlement.clone();
                }
            }
            None => {
                self.entitlements
                    .insert(entitlement.id, Arc::new(RwLock::new(entitlement.clone())));
            }
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) fn book(&self, id: &Ulid) -> Option<SharedBook> {
        self.books.get(id).map(|e| e.value().clone())
    }

    pub(super) fn entitlement_handle(&self, id: &Ulid) -> Option<SharedEntitlement> {
        self.entitlements.get(id).map(|e| e.value().clone())
    }

    pub fn resource_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_index.get(reservation_id).map(|e| *e.value())
    }

    /// WAL-append, apply, notify. The entitlement guard, when given, receives
    /// the entitlement after-image the event carries.
    pub(super) async fn persist_and_apply(
        &self,
        book: &mut ResourceBook,
        entitlement: Option<&mut Entitlement>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_book(book, event, &self.reservation_index);
        if let (
            Some(slot),
            Event::ReservationUpdated {
                entitlement: Some(after),
                ..
            },
        ) = (entitlement, event)
        {
            *slot = after.clone();
            self.notify.send(after.id, event);
        }
        self.notify.send(book.resource.id, event);
        Ok(())
    }

    /// Lookup reservation → resource, acquire the resource's write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ResourceBook>, EngineError> {
        let resource_id = self
            .resource_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let book = self.book(&resource_id).ok_or(EngineError::NotFound(resource_id))?;
        Ok(book.write_owned().await)
    }

    /// Rewrite the WAL with one snapshot event per aggregate.
    ///
    /// Read guards are held until the swap completes, so no transition can
    /// commit between the snapshot and the rewrite.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.write().await;
        let mut events = Vec::new();

        let books: Vec<SharedBook> = self.books.iter().map(|e| e.value().clone()).collect();
        let mut book_guards = Vec::with_capacity(books.len());
        for book in books {
            let guard = book.read_owned().await;
            events.push(Event::ResourceCreated(guard.resource.clone()));
            events.extend(guard.reservations.iter().cloned().map(Event::ReservationCreated));
            book_guards.push(guard);
        }

        let entitlements: Vec<SharedEntitlement> =
            self.entitlements.iter().map(|e| e.value().clone()).collect();
        let mut entitlement_guards = Vec::with_capacity(entitlements.len());
        for entitlement in entitlements {
            let guard = entitlement.read_owned().await;
            events.push(Event::EntitlementSaved(guard.clone()));
            entitlement_guards.push(guard);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(entitlement_guards);
        drop(book_guards);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
