use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::time::{now_ms, parse_instant};

use super::conflict::{check_available, validate_span};
use super::store::{Store, StoreTx, TxScope};
use super::{Engine, EngineError};

fn normalize_guest(guest_id: &str) -> Result<String, EngineError> {
    let guest = guest_id.trim();
    if guest.is_empty() {
        return Err(EngineError::invalid("guest_id is required"));
    }
    if guest.len() > MAX_GUEST_ID_LEN {
        return Err(EngineError::LimitExceeded("guest_id too long"));
    }
    Ok(guest.to_string())
}

fn normalize_room_no(room_no: &str) -> Result<String, EngineError> {
    let room_no = room_no.trim();
    if room_no.is_empty() {
        return Err(EngineError::invalid("room_no is required"));
    }
    if room_no.len() > MAX_ROOM_NO_LEN {
        return Err(EngineError::LimitExceeded("room_no too long"));
    }
    Ok(room_no.to_string())
}

fn normalize_capacity(capacity: i64) -> Result<u32, EngineError> {
    if capacity <= 0 {
        return Err(EngineError::invalid("capacity must be > 0"));
    }
    u32::try_from(capacity).map_err(|_| EngineError::LimitExceeded("capacity too large"))
}

fn instant(raw: &str, field: &str) -> Result<Ms, EngineError> {
    parse_instant(raw).map_err(|e| EngineError::invalid(format!("{field}: {e}")))
}

fn parse_status(raw: &str) -> Result<BookingStatus, EngineError> {
    raw.parse().map_err(|e: UnknownStatus| EngineError::invalid(e.to_string()))
}

/// Normalize raw update fields. Empty changes are allowed and re-validate
/// the stored row as-is.
fn normalize_changes(changes: BookingChanges) -> Result<BookingPatch, EngineError> {
    Ok(BookingPatch {
        room_id: changes.room_id,
        guest_id: changes.guest_id.try_map(|g| normalize_guest(&g))?,
        start: changes.starts_at.try_map(|s| instant(&s, "starts_at"))?,
        end: changes.ends_at.try_map(|s| instant(&s, "ends_at"))?,
        status: changes.status.try_map(|s| parse_status(&s))?,
    })
}

impl<S: Store> Engine<S> {
    /// Create a booking. Validation happens before any reservation is taken;
    /// the room check, conflict check and insert share one transaction.
    pub async fn create_booking(&self, req: NewBooking) -> Result<Booking, EngineError> {
        let guest_id = normalize_guest(&req.guest_id)?;
        let start = instant(&req.starts_at, "starts_at")?;
        let end = instant(&req.ends_at, "ends_at")?;
        let span = validate_span(start, end)?;
        let status = match req.status.as_deref() {
            Some(raw) => parse_status(raw)?,
            None => BookingStatus::default(),
        };

        let booking = Booking {
            id: Ulid::new(),
            room_id: req.room_id,
            guest_id,
            span,
            status,
            created_at: now_ms(),
        };

        let mut tx = self
            .store
            .begin_serialized(TxScope::rooms([booking.room_id]), self.lock_wait)
            .await?;
        let staged = async {
            if !tx.room_exists(&booking.room_id).await? {
                return Err(EngineError::RoomNotFound(booking.room_id));
            }
            // Inactive rows never occupy the schedule.
            if booking.is_active() {
                check_available(&tx, &booking.room_id, &booking.span, None).await?;
            }
            tx.insert_booking(booking.clone())?;
            Ok::<_, EngineError>(())
        }
        .await;
        Self::finish(tx, staged).await?;

        debug!("booking {} created on room {}", booking.id, booking.room_id);
        Ok(booking)
    }

    /// Apply a partial update. The stored row is re-read inside the
    /// transaction; if it moved to a room outside the reserved scope while
    /// waiting, the whole attempt is retried with a fresh scope.
    pub async fn update_booking(&self, id: Ulid, changes: BookingChanges) -> Result<Booking, EngineError> {
        let patch = normalize_changes(changes)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_update_booking(id, &patch).await {
                Err(EngineError::ScopeChanged(_)) if attempt < MAX_SCOPE_RETRIES => {
                    debug!("booking {id} moved during update, retrying ({attempt})");
                }
                other => return other,
            }
        }
    }

    async fn try_update_booking(&self, id: Ulid, patch: &BookingPatch) -> Result<Booking, EngineError> {
        let current = self.store.get_booking(&id).await.ok_or(EngineError::NotFound(id))?;
        // Fail fast on a bad interval before waiting for any reservation.
        let preview = patch.apply(&current);
        validate_span(preview.span.start, preview.span.end)?;

        let scope = TxScope::rooms([current.room_id, preview.room_id]);
        let mut tx = self.store.begin_serialized(scope, self.lock_wait).await?;
        let staged = async {
            let current = tx.load_booking(&id).await?.ok_or(EngineError::NotFound(id))?;
            // Both rooms are reserved: `current.room_id` because load_booking
            // found the row in scope, `next.room_id` because a changed room
            // comes from the patch itself.
            let next = patch.apply(&current);
            validate_span(next.span.start, next.span.end)?;
            if !tx.room_exists(&next.room_id).await? {
                return Err(EngineError::RoomNotFound(next.room_id));
            }
            if next.is_active() {
                check_available(&tx, &next.room_id, &next.span, Some(id)).await?;
            }
            tx.update_booking(current.room_id, next.clone())?;
            Ok::<_, EngineError>(next)
        }
        .await;
        let updated = Self::finish(tx, staged).await?;

        debug!("booking {id} updated");
        Ok(updated)
    }

    /// Delete a booking, returning the removed row.
    pub async fn delete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let room_id = self.store.booking_room(&id).ok_or(EngineError::NotFound(id))?;
            let mut tx = self
                .store
                .begin_serialized(TxScope::rooms([room_id]), self.lock_wait)
                .await?;
            let staged = async {
                let current = tx.load_booking(&id).await?.ok_or(EngineError::NotFound(id))?;
                tx.delete_booking(id, current.room_id)?;
                Ok::<_, EngineError>(current)
            }
            .await;
            match Self::finish(tx, staged).await {
                Err(EngineError::ScopeChanged(_)) if attempt < MAX_SCOPE_RETRIES => continue,
                other => return other,
            }
        }
    }

    pub async fn create_room(&self, req: NewRoom) -> Result<Room, EngineError> {
        let room_no = normalize_room_no(&req.room_no)?;
        let capacity = normalize_capacity(req.capacity)?;
        let room = Room {
            id: Ulid::new(),
            room_no,
            capacity,
            created_at: now_ms(),
        };

        let mut tx = self.store.begin_serialized(TxScope::catalog(), self.lock_wait).await?;
        let staged = async {
            if tx.room_count()? >= MAX_ROOMS {
                return Err(EngineError::LimitExceeded("too many rooms"));
            }
            if tx.room_no_owner(&room.room_no).await?.is_some() {
                return Err(EngineError::DuplicateRoomNo(room.room_no.clone()));
            }
            tx.insert_room(room.clone())?;
            Ok::<_, EngineError>(())
        }
        .await;
        Self::finish(tx, staged).await?;

        info!("room {} created ({})", room.id, room.room_no);
        Ok(room)
    }

    pub async fn update_room(&self, id: Ulid, changes: RoomChanges) -> Result<Room, EngineError> {
        let patch = RoomPatch {
            room_no: changes.room_no.try_map(|n| normalize_room_no(&n))?,
            capacity: changes.capacity.try_map(normalize_capacity)?,
        };
        if patch.is_empty() {
            return Err(EngineError::invalid("no fields to update"));
        }

        let scope = TxScope::rooms([id]).with_catalog();
        let mut tx = self.store.begin_serialized(scope, self.lock_wait).await?;
        let staged = async {
            let current = tx.load_room(&id).await?.ok_or(EngineError::RoomNotFound(id))?;
            let next = patch.apply(&current);
            if next.room_no != current.room_no
                && let Some(owner) = tx.room_no_owner(&next.room_no).await?
                && owner != id
            {
                return Err(EngineError::DuplicateRoomNo(next.room_no));
            }
            tx.update_room(next.clone())?;
            Ok::<_, EngineError>(next)
        }
        .await;
        Self::finish(tx, staged).await
    }

    /// Delete a room and every booking on it.
    pub async fn delete_room(&self, id: Ulid) -> Result<Room, EngineError> {
        let scope = TxScope::rooms([id]).with_catalog();
        let mut tx = self.store.begin_serialized(scope, self.lock_wait).await?;
        let staged = async {
            let room = tx.load_room(&id).await?.ok_or(EngineError::RoomNotFound(id))?;
            tx.delete_room(id)?;
            Ok::<_, EngineError>(room)
        }
        .await;
        let room = Self::finish(tx, staged).await?;

        info!("room {id} deleted ({})", room.room_no);
        Ok(room)
    }
}
