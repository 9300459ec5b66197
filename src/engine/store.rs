use std::time::Duration;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

/// What a serialized transaction reserves before it reads anything.
///
/// Reservations are always taken catalog first, then rooms in ascending id
/// order, so two transactions can never wait on each other in a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxScope {
    /// Rooms whose bookings the transaction reads or writes.
    pub rooms: Vec<Ulid>,
    /// The room catalog (room numbers, room set). Needed for room CRUD.
    pub catalog: bool,
}

impl TxScope {
    pub fn rooms(ids: impl IntoIterator<Item = Ulid>) -> Self {
        let mut rooms: Vec<Ulid> = ids.into_iter().collect();
        rooms.sort();
        rooms.dedup();
        Self { rooms, catalog: false }
    }

    pub fn catalog() -> Self {
        Self { rooms: Vec::new(), catalog: true }
    }

    pub fn with_catalog(mut self) -> Self {
        self.catalog = true;
        self
    }

    pub fn covers(&self, room_id: &Ulid) -> bool {
        self.rooms.binary_search(room_id).is_ok()
    }
}

#[derive(Debug)]
pub enum StoreError {
    /// The reservation wait elapsed before every reservation was granted.
    Busy,
    /// The transaction touched a room it did not reserve.
    OutOfScope(Ulid),
    /// The catalog was touched without being reserved.
    CatalogNotHeld,
    /// The row lives in a room outside the reserved scope (it moved).
    ScopeStale(Ulid),
    Journal(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Busy => write!(f, "timed out waiting for write reservation"),
            StoreError::OutOfScope(id) => write!(f, "room {id} is not reserved by this transaction"),
            StoreError::CatalogNotHeld => write!(f, "room catalog is not reserved by this transaction"),
            StoreError::ScopeStale(id) => write!(f, "booking {id} is outside the reserved rooms"),
            StoreError::Journal(e) => write!(f, "journal: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Durable room/booking storage with a serialized transaction primitive.
///
/// The read methods never wait on reservations; they see committed state.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Tx: StoreTx;

    /// Begin a transaction that holds the exclusive write reservation of
    /// everything in `scope` from this point until commit or rollback.
    /// Fails with [`StoreError::Busy`] if not granted within `wait`.
    async fn begin_serialized(&self, scope: TxScope, wait: Duration) -> Result<Self::Tx, StoreError>;

    /// Room the booking currently belongs to.
    fn booking_room(&self, id: &Ulid) -> Option<Ulid>;

    async fn get_room(&self, id: &Ulid) -> Option<Room>;

    async fn list_rooms(&self) -> Vec<Room>;

    async fn get_booking(&self, id: &Ulid) -> Option<Booking>;

    /// Matching bookings ordered by start, before pagination.
    async fn list_bookings(&self, filter: &BookingFilter) -> Vec<Booking>;

    /// First active booking on `room_id` overlapping `span`, ignoring `exclude`.
    async fn active_overlap(&self, room_id: &Ulid, span: &Span, exclude: Option<Ulid>) -> Option<Ulid>;
}

/// An open serialized transaction. Writes are staged and only become
/// visible on [`StoreTx::commit`]; dropping the transaction rolls back.
#[async_trait]
pub trait StoreTx: Send + Sync {
    async fn room_exists(&self, id: &Ulid) -> Result<bool, StoreError>;

    async fn load_room(&self, id: &Ulid) -> Result<Option<Room>, StoreError>;

    /// Id of the room currently holding `room_no`. Requires the catalog.
    async fn room_no_owner(&self, room_no: &str) -> Result<Option<Ulid>, StoreError>;

    /// Requires the catalog.
    fn room_count(&self) -> Result<usize, StoreError>;

    async fn active_overlap(
        &self,
        room_id: &Ulid,
        span: &Span,
        exclude: Option<Ulid>,
    ) -> Result<Option<Ulid>, StoreError>;

    /// Fails with [`StoreError::ScopeStale`] if the booking exists in a room
    /// this transaction did not reserve.
    async fn load_booking(&self, id: &Ulid) -> Result<Option<Booking>, StoreError>;

    fn insert_booking(&mut self, booking: Booking) -> Result<(), StoreError>;

    /// Replace the stored row with `booking` (possibly in another room).
    fn update_booking(&mut self, previous_room: Ulid, booking: Booking) -> Result<(), StoreError>;

    fn delete_booking(&mut self, id: Ulid, room_id: Ulid) -> Result<(), StoreError>;

    fn insert_room(&mut self, room: Room) -> Result<(), StoreError>;

    fn update_room(&mut self, room: Room) -> Result<(), StoreError>;

    /// Removes the room and every booking on it.
    fn delete_room(&mut self, id: Ulid) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_rooms_are_sorted_and_unique() {
        let a = Ulid::from_parts(1, 0);
        let b = Ulid::from_parts(2, 0);
        let scope = TxScope::rooms([b, a, b]);
        assert_eq!(scope.rooms, vec![a, b]);
        assert!(scope.covers(&a));
        assert!(!scope.covers(&Ulid::from_parts(3, 0)));
        assert!(!scope.catalog);
        assert!(scope.with_catalog().catalog);
    }
}
