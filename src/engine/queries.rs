use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::time::parse_instant;

use super::conflict::validate_span;
use super::store::Store;
use super::{Engine, EngineError};

fn optional_instant(raw: Option<&str>, field: &str) -> Result<Option<Ms>, EngineError> {
    raw.map(|s| parse_instant(s).map_err(|e| EngineError::invalid(format!("{field}: {e}"))))
        .transpose()
}

/// Turn raw listing filters into a [`BookingFilter`]. A limit outside
/// `1..=MAX_LIST_LIMIT` falls back to the default; a negative offset is 0.
pub(crate) fn normalize_query(q: &BookingQuery) -> Result<BookingFilter, EngineError> {
    let status = q
        .status
        .as_deref()
        .map(|s| s.parse::<BookingStatus>())
        .transpose()
        .map_err(|e| EngineError::invalid(e.to_string()))?;
    let limit = match q.limit {
        Some(n) if n >= 1 && n as u64 <= MAX_LIST_LIMIT as u64 => n as usize,
        _ => DEFAULT_LIST_LIMIT,
    };
    let offset = q.offset.map_or(0, |n| n.max(0) as usize);
    Ok(BookingFilter {
        room_id: q.room_id,
        status,
        from: optional_instant(q.from.as_deref(), "from")?,
        to: optional_instant(q.to.as_deref(), "to")?,
        limit,
        offset,
    })
}

impl<S: Store> Engine<S> {
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.store.get_booking(&id).await.ok_or(EngineError::NotFound(id))
    }

    /// Bookings matching the filters, ordered by start, then paginated.
    pub async fn list_bookings(&self, query: &BookingQuery) -> Result<Vec<Booking>, EngineError> {
        let filter = normalize_query(query)?;
        let rows = self.store.list_bookings(&filter).await;
        Ok(rows.into_iter().skip(filter.offset).take(filter.limit).collect())
    }

    /// Read-only conflict probe. Takes no reservation, so the answer may be
    /// stale by the time a write is attempted; writes re-check.
    pub async fn has_conflict(
        &self,
        room_id: Ulid,
        starts_at: &str,
        ends_at: &str,
        exclude: Option<Ulid>,
    ) -> Result<Option<Ulid>, EngineError> {
        let start = parse_instant(starts_at).map_err(|e| EngineError::invalid(format!("starts_at: {e}")))?;
        let end = parse_instant(ends_at).map_err(|e| EngineError::invalid(format!("ends_at: {e}")))?;
        let span = validate_span(start, end)?;
        Ok(self.store.active_overlap(&room_id, &span, exclude).await)
    }

    pub async fn get_room(&self, id: Ulid) -> Result<Room, EngineError> {
        self.store.get_room(&id).await.ok_or(EngineError::RoomNotFound(id))
    }

    /// Newest first.
    pub async fn list_rooms(&self) -> Vec<Room> {
        self.store.list_rooms().await
    }
}
