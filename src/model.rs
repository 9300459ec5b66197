use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every stored instant uses this.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }
}

/// Half-open intersection test. Touching intervals do not overlap, so
/// back-to-back bookings are always allowed.
pub fn overlaps(candidate_start: Ms, candidate_end: Ms, other_start: Ms, other_end: Ms) -> bool {
    other_start < candidate_end && other_end > candidate_start
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    #[default]
    Pending,
    Confirmed,
    Cancelled,
    Done,
}

impl BookingStatus {
    /// Active bookings occupy the room's schedule.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Done => "DONE",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for BookingStatus {
    type Err = UnknownStatus;

    /// Case-insensitive; surrounding whitespace is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(BookingStatus::Pending),
            "CONFIRMED" => Ok(BookingStatus::Confirmed),
            "CANCELLED" => Ok(BookingStatus::Cancelled),
            "DONE" => Ok(BookingStatus::Done),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub room_no: String,
    pub capacity: u32,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub room_id: Ulid,
    pub guest_id: String,
    pub span: Span,
    pub status: BookingStatus,
    pub created_at: Ms,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// One field of a partial update: leave it alone, or replace it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Patch<T> {
    Keep,
    Set(T),
}

impl<T> Default for Patch<T> {
    fn default() -> Self {
        Patch::Keep
    }
}

impl<T> Patch<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, Patch::Keep)
    }

    /// Map a set value through a fallible conversion.
    pub fn try_map<U, E, F: FnOnce(T) -> Result<U, E>>(self, f: F) -> Result<Patch<U>, E> {
        match self {
            Patch::Keep => Ok(Patch::Keep),
            Patch::Set(v) => f(v).map(Patch::Set),
        }
    }
}

impl<T: Clone> Patch<T> {
    pub fn apply(&self, current: &T) -> T {
        match self {
            Patch::Keep => current.clone(),
            Patch::Set(v) => v.clone(),
        }
    }
}

impl<T> From<Option<T>> for Patch<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Patch::Set(v),
            None => Patch::Keep,
        }
    }
}

/// Normalized partial update of a booking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub room_id: Patch<Ulid>,
    pub guest_id: Patch<String>,
    pub start: Patch<Ms>,
    pub end: Patch<Ms>,
    pub status: Patch<BookingStatus>,
}

impl BookingPatch {
    /// The row that results from applying this patch to `current`.
    /// The interval is not validated here.
    pub fn apply(&self, current: &Booking) -> Booking {
        Booking {
            id: current.id,
            room_id: self.room_id.apply(&current.room_id),
            guest_id: self.guest_id.apply(&current.guest_id),
            span: Span {
                start: self.start.apply(&current.span.start),
                end: self.end.apply(&current.span.end),
            },
            status: self.status.apply(&current.status),
            created_at: current.created_at,
        }
    }
}

/// Normalized partial update of a room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomPatch {
    pub room_no: Patch<String>,
    pub capacity: Patch<u32>,
}

impl RoomPatch {
    pub fn is_empty(&self) -> bool {
        self.room_no.is_keep() && self.capacity.is_keep()
    }

    pub fn apply(&self, current: &Room) -> Room {
        Room {
            id: current.id,
            room_no: self.room_no.apply(&current.room_no),
            capacity: self.capacity.apply(&current.capacity),
            created_at: current.created_at,
        }
    }
}

// ── Boundary inputs (raw, not yet normalized) ─────────────────────

/// A booking request as it arrives from the API layer. Instants are
/// RFC3339 strings; the engine normalizes them before anything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub room_id: Ulid,
    pub guest_id: String,
    pub starts_at: String,
    pub ends_at: String,
    pub status: Option<String>,
}

/// Raw partial booking update from the API layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingChanges {
    pub room_id: Patch<Ulid>,
    pub guest_id: Patch<String>,
    pub starts_at: Patch<String>,
    pub ends_at: Patch<String>,
    pub status: Patch<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRoom {
    pub room_no: String,
    pub capacity: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomChanges {
    pub room_no: Patch<String>,
    pub capacity: Patch<i64>,
}

/// Raw booking listing filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingQuery {
    pub room_id: Option<Ulid>,
    pub status: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Normalized booking listing filters. A booking matches the window when
/// `end > from` and `start < to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingFilter {
    pub room_id: Option<Ulid>,
    pub status: Option<BookingStatus>,
    pub from: Option<Ms>,
    pub to: Option<Ms>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for BookingFilter {
    fn default() -> Self {
        Self {
            room_id: None,
            status: None,
            from: None,
            to: None,
            limit: crate::limits::DEFAULT_LIST_LIMIT,
            offset: 0,
        }
    }
}

impl BookingFilter {
    pub fn matches(&self, booking: &Booking) -> bool {
        self.room_id.is_none_or(|r| booking.room_id == r)
            && self.status.is_none_or(|s| booking.status == s)
            && self.from.is_none_or(|from| booking.span.end > from)
            && self.to.is_none_or(|to| booking.span.start < to)
    }
}

/// Committed state changes, one per WAL record. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        room: Room,
    },
    RoomUpdated {
        id: Ulid,
        room_no: String,
        capacity: u32,
    },
    RoomDeleted {
        id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    /// Full resulting row; `room_id` may differ from the previous one.
    BookingUpdated {
        booking: Booking,
    },
    BookingDeleted {
        id: Ulid,
        room_id: Ulid,
    },
}
