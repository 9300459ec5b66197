use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::store::StoreTx;
use super::EngineError;

/// Reject intervals the engine will never store: empty or inverted, outside
/// the accepted epoch range, or longer than a single booking may be.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::invalid("ends_at must be after starts_at"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    Ok(span)
}

/// First active booking among `candidates` overlapping `span`, other than
/// `exclude`. Candidates may be a pre-narrowed window or a room's full list.
pub fn find_conflict<'a>(
    candidates: impl IntoIterator<Item = &'a Booking>,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<Ulid> {
    candidates
        .into_iter()
        .filter(|b| b.is_active() && Some(b.id) != exclude)
        .find(|b| overlaps(span.start, span.end, b.span.start, b.span.end))
        .map(|b| b.id)
}

/// Conflict check inside an open serialized transaction. The single code
/// path shared by create and update.
pub(crate) async fn check_available<T: StoreTx>(
    tx: &T,
    room_id: &Ulid,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match tx.active_overlap(room_id, span, exclude).await? {
        Some(blocking) => {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            Err(EngineError::Conflict(blocking))
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            room_id: Ulid::nil(),
            guest_id: "g".into(),
            span: Span::new(start, end),
            status,
            created_at: 0,
        }
    }

    #[test]
    fn find_conflict_over_a_plain_slice() {
        let blocking = booking(150, 250, BookingStatus::Confirmed);
        let list = vec![
            booking(100, 200, BookingStatus::Cancelled),
            booking(0, 100, BookingStatus::Pending),
            blocking.clone(),
        ];
        let q = Span::new(100, 200);
        assert_eq!(find_conflict(&list, &q, None), Some(blocking.id));
        assert_eq!(find_conflict(&list, &q, Some(blocking.id)), None);
        assert_eq!(find_conflict(&list, &Span::new(250, 300), None), None);
        assert_eq!(find_conflict(&[], &q, None), None);
    }

    #[test]
    fn validate_span_rejects_empty_and_inverted() {
        assert!(validate_span(MIN_VALID_TIMESTAMP_MS + 10, MIN_VALID_TIMESTAMP_MS + 10).is_err());
        assert!(validate_span(MIN_VALID_TIMESTAMP_MS + 10, MIN_VALID_TIMESTAMP_MS).is_err());
        assert!(validate_span(MIN_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS + 1).is_ok());
    }
}
