use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

use super::conflict::find_conflict;
use super::store::{Store, StoreError, StoreTx, TxScope};

// ── Committed room state ─────────────────────────────────

#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    /// Bookings of every status, sorted by `span.start`.
    pub bookings: Vec<Booking>,
    /// Set when the room is deleted. A transaction that was waiting on the
    /// room's reservation must then treat the room as missing.
    pub removed: bool,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            bookings: Vec::new(),
            removed: false,
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn get_booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    /// Return only bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// A room's write-intent reservation next to its committed state.
/// Transactions hold `reservation` for their whole lifetime; `state` is only
/// write-locked for the instant a commit is applied, so readers never wait
/// on an open transaction.
struct RoomSlot {
    reservation: Arc<Mutex<()>>,
    state: RwLock<RoomState>,
}

impl RoomSlot {
    fn new(room: Room) -> Self {
        Self {
            reservation: Arc::new(Mutex::new(())),
            state: RwLock::new(RoomState::new(room)),
        }
    }
}

type SharedRoom = Arc<RoomSlot>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
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
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush the current batch before anything else.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
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
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_snapshot(wal.path(), &events)
                .and_then(|()| wal.install_snapshot());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

// ── Store ────────────────────────────────────────────────

struct Shared {
    rooms: DashMap<Ulid, SharedRoom>,
    /// Reverse lookup: booking id → room id.
    booking_to_room: DashMap<Ulid, Ulid>,
    /// room_no → room id, for uniqueness checks.
    room_numbers: DashMap<String, Ulid>,
    /// Reservation guarding the room set and room numbers.
    catalog: Arc<Mutex<()>>,
    /// `None` for an ephemeral store.
    wal_tx: Option<mpsc::Sender<WalCommand>>,
}

impl Shared {
    fn room(&self, id: &Ulid) -> Option<SharedRoom> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    fn booking_room(&self, id: &Ulid) -> Option<Ulid> {
        self.booking_to_room.get(id).map(|e| *e.value())
    }

    fn all_rooms(&self) -> Vec<SharedRoom> {
        self.rooms.iter().map(|e| e.value().clone()).collect()
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Journal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Journal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Journal(e.to_string()))
    }

    /// WAL-append, then apply. Nothing is applied if the append fails.
    async fn persist_and_apply(&self, event: &Event) -> Result<(), StoreError> {
        self.wal_append(event).await?;
        self.apply(event).await;
        Ok(())
    }

    /// Apply a committed event. Callers hold every reservation the event
    /// touches (or are replaying with no concurrency).
    async fn apply(&self, event: &Event) {
        match event {
            Event::RoomCreated { room } => {
                self.room_numbers.insert(room.room_no.clone(), room.id);
                self.rooms.insert(room.id, Arc::new(RoomSlot::new(room.clone())));
            }
            Event::RoomUpdated { id, room_no, capacity } => {
                let Some(slot) = self.room(id) else { return };
                let mut rs = slot.state.write().await;
                if rs.room.room_no != *room_no {
                    self.room_numbers.remove(&rs.room.room_no);
                    self.room_numbers.insert(room_no.clone(), *id);
                }
                rs.room.room_no = room_no.clone();
                rs.room.capacity = *capacity;
            }
            Event::RoomDeleted { id } => {
                let Some((_, slot)) = self.rooms.remove(id) else { return };
                let mut rs = slot.state.write().await;
                rs.removed = true;
                self.room_numbers.remove(&rs.room.room_no);
                for booking in rs.bookings.drain(..) {
                    self.booking_to_room.remove(&booking.id);
                }
            }
            Event::BookingCreated { booking } | Event::BookingUpdated { booking } => {
                let previous = self.booking_room(&booking.id).and_then(|rid| self.room(&rid));
                let Some(target) = self.room(&booking.room_id) else {
                    if let Some(prev) = previous {
                        prev.state.write().await.remove_booking(booking.id);
                    }
                    self.booking_to_room.remove(&booking.id);
                    return;
                };
                match previous {
                    Some(prev) if !Arc::ptr_eq(&prev, &target) => {
                        // Room move: both rooms change under one exclusive
                        // section, locked in id order.
                        let prev_first = {
                            let p = prev.state.read().await.room.id;
                            p < booking.room_id
                        };
                        let (first, second) = if prev_first { (&prev, &target) } else { (&target, &prev) };
                        let mut a = first.state.write().await;
                        let mut b = second.state.write().await;
                        let (from, to) = if prev_first { (&mut *a, &mut *b) } else { (&mut *b, &mut *a) };
                        from.remove_booking(booking.id);
                        to.insert_booking(booking.clone());
                    }
                    _ => {
                        let mut rs = target.state.write().await;
                        rs.remove_booking(booking.id);
                        rs.insert_booking(booking.clone());
                    }
                }
                self.booking_to_room.insert(booking.id, booking.room_id);
            }
            Event::BookingDeleted { id, room_id } => {
                if let Some(slot) = self.room(room_id) {
                    slot.state.write().await.remove_booking(*id);
                }
                self.booking_to_room.remove(id);
            }
        }
    }

    async fn reserve_rooms(&self, ids: &[Ulid]) -> (Vec<(Ulid, Option<SharedRoom>)>, Vec<OwnedMutexGuard<()>>) {
        let mut rooms = Vec::with_capacity(ids.len());
        let mut reservations = Vec::with_capacity(ids.len());
        for id in ids {
            let slot = self.room(id);
            if let Some(slot) = &slot {
                reservations.push(slot.reservation.clone().lock_owned().await);
            }
            rooms.push((*id, slot));
        }
        (rooms, reservations)
    }

    async fn reserve(self: Arc<Self>, scope: TxScope) -> MemTx {
        let catalog = if scope.catalog {
            Some(self.catalog.clone().lock_owned().await)
        } else {
            None
        };
        let (rooms, reservations) = self.reserve_rooms(&scope.rooms).await;
        MemTx {
            shared: self,
            scope,
            rooms,
            _catalog: catalog,
            _reservations: reservations,
            staged: Vec::new(),
        }
    }
}

/// In-memory store with an optional write-ahead log.
#[derive(Clone)]
pub struct MemStore {
    shared: Arc<Shared>,
}

impl MemStore {
    fn with_journal(wal_tx: Option<mpsc::Sender<WalCommand>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                rooms: DashMap::new(),
                booking_to_room: DashMap::new(),
                room_numbers: DashMap::new(),
                catalog: Arc::new(Mutex::new(())),
                wal_tx,
            }),
        }
    }

    /// A store that keeps nothing on disk.
    pub fn ephemeral() -> Self {
        Self::with_journal(None)
    }

    /// Replay the WAL at `wal_path` and start its group-commit writer.
    /// Must be called inside a tokio runtime.
    pub async fn open(wal_path: &Path) -> io::Result<Self> {
        let events = Wal::replay(wal_path)?;
        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self::with_journal(Some(wal_tx));
        for event in &events {
            store.shared.apply(event).await;
        }
        info!("replayed {} events from {}", events.len(), wal_path.display());
        Ok(store)
    }

    pub fn room_count(&self) -> usize {
        self.shared.rooms.len()
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    /// Holds the catalog and every room reservation while it snapshots, so
    /// no commit can land between the snapshot and the swap.
    pub async fn compact(&self, wait: Duration) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.shared.wal_tx else {
            return Ok(());
        };
        let shared = self.shared.clone();
        let reserve_all = async move {
            let catalog = shared.catalog.clone().lock_owned().await;
            let mut ids: Vec<Ulid> = shared.rooms.iter().map(|e| *e.key()).collect();
            ids.sort();
            let (rooms, reservations) = shared.reserve_rooms(&ids).await;
            (catalog, rooms, reservations)
        };
        let (_catalog, rooms, _reservations) = tokio::time::timeout(wait, reserve_all)
            .await
            .map_err(|_| StoreError::Busy)?;

        let mut events = Vec::new();
        for (_, slot) in rooms.iter() {
            let Some(slot) = slot else { continue };
            let rs = slot.state.read().await;
            if rs.removed {
                continue;
            }
            events.push(Event::RoomCreated { room: rs.room.clone() });
            for booking in &rs.bookings {
                events.push(Event::BookingCreated { booking: booking.clone() });
            }
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Journal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Journal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Journal(e.to_string()))?;
        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.shared.wal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl Store for MemStore {
    type Tx = MemTx;

    async fn begin_serialized(&self, scope: TxScope, wait: Duration) -> Result<MemTx, StoreError> {
        let started = Instant::now();
        let acquired = tokio::time::timeout(wait, self.shared.clone().reserve(scope)).await;
        metrics::histogram!(crate::observability::RESERVATION_WAIT_SECONDS)
            .record(started.elapsed().as_secs_f64());
        acquired.map_err(|_| {
            metrics::counter!(crate::observability::RESERVATION_TIMEOUTS_TOTAL).increment(1);
            warn!("write reservation not granted within {}ms", wait.as_millis());
            StoreError::Busy
        })
    }

    fn booking_room(&self, id: &Ulid) -> Option<Ulid> {
        self.shared.booking_room(id)
    }

    async fn get_room(&self, id: &Ulid) -> Option<Room> {
        let slot = self.shared.room(id)?;
        let rs = slot.state.read().await;
        (!rs.removed).then(|| rs.room.clone())
    }

    async fn list_rooms(&self) -> Vec<Room> {
        let mut rooms = Vec::new();
        for slot in self.shared.all_rooms() {
            let rs = slot.state.read().await;
            if !rs.removed {
                rooms.push(rs.room.clone());
            }
        }
        rooms.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        rooms
    }

    async fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        // A concurrent room move can relocate the row between the index
        // lookup and the read; look once more before giving up.
        for _ in 0..2 {
            let room_id = self.shared.booking_room(id)?;
            if let Some(slot) = self.shared.room(&room_id) {
                let rs = slot.state.read().await;
                if let Some(b) = rs.get_booking(id) {
                    return Some(b.clone());
                }
            }
        }
        None
    }

    async fn list_bookings(&self, filter: &BookingFilter) -> Vec<Booking> {
        let slots = match filter.room_id {
            Some(rid) => self.shared.room(&rid).into_iter().collect(),
            None => self.shared.all_rooms(),
        };
        let mut out = Vec::new();
        for slot in slots {
            let rs = slot.state.read().await;
            if rs.removed {
                continue;
            }
            out.extend(rs.bookings.iter().filter(|b| filter.matches(b)).cloned());
        }
        out.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
        out
    }

    async fn active_overlap(&self, room_id: &Ulid, span: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
        let slot = self.shared.room(room_id)?;
        let rs = slot.state.read().await;
        if rs.removed {
            return None;
        }
        find_conflict(rs.overlapping(span), span, exclude)
    }
}

// ── Transaction ──────────────────────────────────────────

/// Serialized transaction over [`MemStore`]. Holds its reservations until
/// dropped; staged events are journaled and applied on commit.
pub struct MemTx {
    shared: Arc<Shared>,
    scope: TxScope,
    /// Reserved rooms; `None` where the room did not exist at reservation time.
    rooms: Vec<(Ulid, Option<SharedRoom>)>,
    _catalog: Option<OwnedMutexGuard<()>>,
    _reservations: Vec<OwnedMutexGuard<()>>,
    staged: Vec<Event>,
}

impl MemTx {
    fn slot(&self, id: &Ulid) -> Result<Option<&SharedRoom>, StoreError> {
        self.rooms
            .iter()
            .find(|(rid, _)| rid == id)
            .map(|(_, slot)| slot.as_ref())
            .ok_or(StoreError::OutOfScope(*id))
    }

    /// Committed state of a reserved room, or `None` if it does not exist.
    async fn live_state(&self, id: &Ulid) -> Result<Option<RwLockReadGuard<'_, RoomState>>, StoreError> {
        let Some(slot) = self.slot(id)? else {
            return Ok(None);
        };
        let rs = slot.state.read().await;
        Ok((!rs.removed).then_some(rs))
    }

    fn require_room(&self, id: &Ulid) -> Result<(), StoreError> {
        match self.slot(id)? {
            Some(_) => Ok(()),
            None => Err(StoreError::OutOfScope(*id)),
        }
    }

    fn require_catalog(&self) -> Result<(), StoreError> {
        if self.scope.catalog {
            Ok(())
        } else {
            Err(StoreError::CatalogNotHeld)
        }
    }
}

#[async_trait]
impl StoreTx for MemTx {
    async fn room_exists(&self, id: &Ulid) -> Result<bool, StoreError> {
        Ok(self.live_state(id).await?.is_some())
    }

    async fn load_room(&self, id: &Ulid) -> Result<Option<Room>, StoreError> {
        Ok(self.live_state(id).await?.map(|rs| rs.room.clone()))
    }

    async fn room_no_owner(&self, room_no: &str) -> Result<Option<Ulid>, StoreError> {
        self.require_catalog()?;
        Ok(self.shared.room_numbers.get(room_no).map(|e| *e.value()))
    }

    fn room_count(&self) -> Result<usize, StoreError> {
        self.require_catalog()?;
        Ok(self.shared.rooms.len())
    }

    async fn active_overlap(
        &self,
        room_id: &Ulid,
        span: &Span,
        exclude: Option<Ulid>,
    ) -> Result<Option<Ulid>, StoreError> {
        Ok(self
            .live_state(room_id)
            .await?
            .and_then(|rs| find_conflict(rs.overlapping(span), span, exclude)))
    }

    async fn load_booking(&self, id: &Ulid) -> Result<Option<Booking>, StoreError> {
        for (rid, _) in &self.rooms {
            if let Some(rs) = self.live_state(rid).await?
                && let Some(b) = rs.get_booking(id)
            {
                return Ok(Some(b.clone()));
            }
        }
        match self.shared.booking_room(id) {
            Some(_) => Err(StoreError::ScopeStale(*id)),
            None => Ok(None),
        }
    }

    fn insert_booking(&mut self, booking: Booking) -> Result<(), StoreError> {
        self.require_room(&booking.room_id)?;
        self.staged.push(Event::BookingCreated { booking });
        Ok(())
    }

    fn update_booking(&mut self, previous_room: Ulid, booking: Booking) -> Result<(), StoreError> {
        self.require_room(&previous_room)?;
        self.require_room(&booking.room_id)?;
        self.staged.push(Event::BookingUpdated { booking });
        Ok(())
    }

    fn delete_booking(&mut self, id: Ulid, room_id: Ulid) -> Result<(), StoreError> {
        self.require_room(&room_id)?;
        self.staged.push(Event::BookingDeleted { id, room_id });
        Ok(())
    }

    fn insert_room(&mut self, room: Room) -> Result<(), StoreError> {
        self.require_catalog()?;
        self.staged.push(Event::RoomCreated { room });
        Ok(())
    }

    fn update_room(&mut self, room: Room) -> Result<(), StoreError> {
        self.require_catalog()?;
        self.require_room(&room.id)?;
        self.staged.push(Event::RoomUpdated {
            id: room.id,
            room_no: room.room_no,
            capacity: room.capacity,
        });
        Ok(())
    }

    fn delete_room(&mut self, id: Ulid) -> Result<(), StoreError> {
        self.require_catalog()?;
        self.require_room(&id)?;
        self.staged.push(Event::RoomDeleted { id });
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        for event in &self.staged {
            self.shared.persist_and_apply(event).await?;
        }
        Ok(())
    }

    async fn rollback(self) {
        debug!("rollback: discarding {} staged writes", self.staged.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(no: &str) -> Room {
        Room {
            id: Ulid::new(),
            room_no: no.into(),
            capacity: 2,
            created_at: 0,
        }
    }

    fn booking_in(room_id: Ulid, start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            room_id,
            guest_id: "g".into(),
            span: Span::new(start, end),
            status,
            created_at: 0,
        }
    }

    const WAIT: Duration = Duration::from_millis(500);

    async fn store_with_room() -> (MemStore, Room) {
        let store = MemStore::ephemeral();
        let r = room("101");
        let mut tx = store.begin_serialized(TxScope::catalog(), WAIT).await.unwrap();
        tx.insert_room(r.clone()).unwrap();
        tx.commit().await.unwrap();
        (store, r)
    }

    #[test]
    fn bookings_kept_sorted_by_start() {
        let r = room("1");
        let mut rs = RoomState::new(r.clone());
        rs.insert_booking(booking_in(r.id, 300, 400, BookingStatus::Pending));
        rs.insert_booking(booking_in(r.id, 100, 200, BookingStatus::Done));
        rs.insert_booking(booking_in(r.id, 200, 300, BookingStatus::Confirmed));
        let starts: Vec<Ms> = rs.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let r = room("1");
        let mut rs = RoomState::new(r.clone());
        rs.insert_booking(booking_in(r.id, 100, 200, BookingStatus::Pending));
        rs.insert_booking(booking_in(r.id, 450, 600, BookingStatus::Pending));
        rs.insert_booking(booking_in(r.id, 1000, 1100, BookingStatus::Pending));
        let hits: Vec<_> = rs.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let r = room("1");
        let mut rs = RoomState::new(r.clone());
        rs.insert_booking(booking_in(r.id, 100, 200, BookingStatus::Pending));
        assert_eq!(rs.overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(rs.overlapping(&Span::new(0, 100)).count(), 0);
    }

    #[test]
    fn overlapping_long_booking_spanning_query() {
        let r = room("1");
        let mut rs = RoomState::new(r.clone());
        rs.insert_booking(booking_in(r.id, 0, 10_000, BookingStatus::Pending));
        rs.insert_booking(booking_in(r.id, 20, 30, BookingStatus::Pending));
        assert_eq!(rs.overlapping(&Span::new(500, 600)).count(), 1);
    }

    #[test]
    fn find_conflict_ignores_inactive_and_excluded() {
        let r = room("1");
        let mut rs = RoomState::new(r.clone());
        let cancelled = booking_in(r.id, 100, 200, BookingStatus::Cancelled);
        let done = booking_in(r.id, 100, 200, BookingStatus::Done);
        let pending = booking_in(r.id, 150, 250, BookingStatus::Pending);
        let pending_id = pending.id;
        rs.insert_booking(cancelled);
        rs.insert_booking(done);
        rs.insert_booking(pending);

        let q = Span::new(100, 200);
        assert_eq!(find_conflict(rs.overlapping(&q), &q, None), Some(pending_id));
        assert_eq!(find_conflict(rs.overlapping(&q), &q, Some(pending_id)), None);
        let before = Span::new(100, 150);
        assert_eq!(find_conflict(rs.overlapping(&before), &before, None), None);
    }

    #[tokio::test]
    async fn staged_writes_invisible_until_commit() {
        let (store, r) = store_with_room().await;
        let b = booking_in(r.id, 1_000, 2_000, BookingStatus::Pending);

        let mut tx = store.begin_serialized(TxScope::rooms([r.id]), WAIT).await.unwrap();
        tx.insert_booking(b.clone()).unwrap();
        // Readers don't wait on the open transaction and don't see the write.
        assert!(store.get_booking(&b.id).await.is_none());
        assert!(store.active_overlap(&r.id, &b.span, None).await.is_none());
        tx.commit().await.unwrap();

        assert_eq!(store.get_booking(&b.id).await, Some(b.clone()));
        assert_eq!(store.active_overlap(&r.id, &b.span, None).await, Some(b.id));
    }

    #[tokio::test]
    async fn rollback_discards_staged_writes() {
        let (store, r) = store_with_room().await;
        let b = booking_in(r.id, 1_000, 2_000, BookingStatus::Pending);
        let mut tx = store.begin_serialized(TxScope::rooms([r.id]), WAIT).await.unwrap();
        tx.insert_booking(b.clone()).unwrap();
        tx.rollback().await;
        assert!(store.get_booking(&b.id).await.is_none());
        assert!(store.booking_room(&b.id).is_none());
    }

    #[tokio::test]
    async fn second_reservation_waits_then_times_out() {
        let (store, r) = store_with_room().await;
        let held = store.begin_serialized(TxScope::rooms([r.id]), WAIT).await.unwrap();
        let second = store
            .begin_serialized(TxScope::rooms([r.id]), Duration::from_millis(50))
            .await;
        assert!(matches!(second, Err(StoreError::Busy)));
        drop(held);
        let third = store.begin_serialized(TxScope::rooms([r.id]), WAIT).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn other_rooms_are_not_blocked() {
        let store = MemStore::ephemeral();
        let a = room("a");
        let b = room("b");
        let mut tx = store.begin_serialized(TxScope::catalog(), WAIT).await.unwrap();
        tx.insert_room(a.clone()).unwrap();
        tx.insert_room(b.clone()).unwrap();
        tx.commit().await.unwrap();

        let _held = store.begin_serialized(TxScope::rooms([a.id]), WAIT).await.unwrap();
        let other = store
            .begin_serialized(TxScope::rooms([b.id]), Duration::from_millis(50))
            .await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn touching_unreserved_room_is_rejected() {
        let (store, r) = store_with_room().await;
        let tx = store.begin_serialized(TxScope::rooms([r.id]), WAIT).await.unwrap();
        let stranger = Ulid::new();
        assert!(matches!(tx.room_exists(&stranger).await, Err(StoreError::OutOfScope(_))));
        assert!(matches!(tx.room_count(), Err(StoreError::CatalogNotHeld)));
    }

    #[tokio::test]
    async fn load_booking_outside_scope_is_stale() {
        let store = MemStore::ephemeral();
        let a = room("a");
        let b = room("b");
        let mut tx = store.begin_serialized(TxScope::catalog(), WAIT).await.unwrap();
        tx.insert_room(a.clone()).unwrap();
        tx.insert_room(b.clone()).unwrap();
        tx.commit().await.unwrap();

        let bk = booking_in(b.id, 0, 10, BookingStatus::Pending);
        let mut tx = store.begin_serialized(TxScope::rooms([b.id]), WAIT).await.unwrap();
        tx.insert_booking(bk.clone()).unwrap();
        tx.commit().await.unwrap();

        let tx = store.begin_serialized(TxScope::rooms([a.id]), WAIT).await.unwrap();
        assert!(matches!(tx.load_booking(&bk.id).await, Err(StoreError::ScopeStale(_))));
        assert!(matches!(tx.load_booking(&Ulid::new()).await, Ok(None)));
    }

    #[tokio::test]
    async fn room_move_updates_both_rooms_and_index() {
        let store = MemStore::ephemeral();
        let a = room("a");
        let b = room("b");
        let mut tx = store.begin_serialized(TxScope::catalog(), WAIT).await.unwrap();
        tx.insert_room(a.clone()).unwrap();
        tx.insert_room(b.clone()).unwrap();
        tx.commit().await.unwrap();

        let bk = booking_in(a.id, 0, 10, BookingStatus::Pending);
        let mut tx = store.begin_serialized(TxScope::rooms([a.id]), WAIT).await.unwrap();
        tx.insert_booking(bk.clone()).unwrap();
        tx.commit().await.unwrap();

        let moved = Booking { room_id: b.id, ..bk.clone() };
        let mut tx = store.begin_serialized(TxScope::rooms([a.id, b.id]), WAIT).await.unwrap();
        tx.update_booking(a.id, moved.clone()).unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.booking_room(&bk.id), Some(b.id));
        assert!(store.active_overlap(&a.id, &bk.span, None).await.is_none());
        assert_eq!(store.active_overlap(&b.id, &bk.span, None).await, Some(bk.id));
        let in_a = store
            .list_bookings(&BookingFilter { room_id: Some(a.id), ..Default::default() })
            .await;
        assert!(in_a.is_empty());
    }

    #[tokio::test]
    async fn room_delete_cascades_and_frees_number() {
        let (store, r) = store_with_room().await;
        let bk = booking_in(r.id, 0, 10, BookingStatus::Pending);
        let mut tx = store.begin_serialized(TxScope::rooms([r.id]), WAIT).await.unwrap();
        tx.insert_booking(bk.clone()).unwrap();
        tx.commit().await.unwrap();

        let mut tx = store
            .begin_serialized(TxScope::rooms([r.id]).with_catalog(), WAIT)
            .await
            .unwrap();
        tx.delete_room(r.id).unwrap();
        tx.commit().await.unwrap();

        assert!(store.get_room(&r.id).await.is_none());
        assert!(store.get_booking(&bk.id).await.is_none());
        assert!(store.booking_room(&bk.id).is_none());
        let tx = store.begin_serialized(TxScope::catalog(), WAIT).await.unwrap();
        assert_eq!(tx.room_no_owner("101").await.unwrap(), None);
    }

    #[tokio::test]
    async fn waiter_on_deleted_room_sees_it_missing() {
        let (store, r) = store_with_room().await;
        let mut deleter = store
            .begin_serialized(TxScope::rooms([r.id]).with_catalog(), WAIT)
            .await
            .unwrap();

        let waiter_store = store.clone();
        let rid = r.id;
        let waiter = tokio::spawn(async move {
            let tx = waiter_store
                .begin_serialized(TxScope::rooms([rid]), Duration::from_secs(5))
                .await
                .unwrap();
            tx.room_exists(&rid).await.unwrap()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        deleter.delete_room(r.id).unwrap();
        deleter.commit().await.unwrap();

        assert!(!waiter.await.unwrap());
    }
}
