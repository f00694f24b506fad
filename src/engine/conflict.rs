use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::model::*;

use super::availability::merge_overlapping;
use super::EngineError;

pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Fail with `Conflict` if `span` overlaps any active reservation in the
/// schedule other than `exclude`. Caller holds the schedule's write lock
/// through the subsequent WAL append, so the check cannot go stale.
pub(crate) fn check_no_conflict(
    day: &DaySchedule,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    for existing in day.overlapping(span) {
        if Some(existing.id) == exclude || !existing.status.is_active() {
            continue;
        }
        // `overlapping` already filtered by start/end; re-check through the
        // predicate so the half-open rule has a single definition.
        if existing.span().overlaps(span) {
            return Err(EngineError::Conflict(existing.id));
        }
    }
    Ok(())
}

/// Sorted, merged busy spans of active reservations across `days`.
pub(crate) fn busy_spans<'a>(days: impl IntoIterator<Item = &'a DaySchedule>) -> Vec<Span> {
    let mut spans: Vec<Span> = days.into_iter().flat_map(DaySchedule::active_spans).collect();
    spans.sort_by_key(|s| s.start);
    merge_overlapping(&spans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn t(s: &str) -> ClockTime {
        s.parse().unwrap()
    }

    fn day_with(bookings: &[(&str, &str, ReservationStatus)]) -> DaySchedule {
        let key = ResourceKey {
            employee_id: Some(Ulid::new()),
            date: NaiveDate::from_ymd_opt(2026, 5, 4).unwrap(),
        };
        let mut day = DaySchedule::new(key);
        for (start, end, status) in bookings {
            let ts = now();
            day.insert(Reservation {
                id: Ulid::new(),
                customer_name: "C".into(),
                customer_email: "c@example.com".into(),
                customer_phone: "1".into(),
                date: key.date,
                start_time: t(start),
                end_time: t(end),
                service_id: Ulid::new(),
                employee_id: key.employee_id,
                status: *status,
                price: 0,
                payment_method: PaymentMethod::Cash,
                email_notify: false,
                sms_notify: false,
                notes: None,
                created_at: ts,
                updated_at: ts,
            });
        }
        day
    }

    fn span(a: &str, b: &str) -> Span {
        Span::new(t(a).minutes(), t(b).minutes())
    }

    #[test]
    fn overlap_is_conflict() {
        let day = day_with(&[("10:00", "10:45", ReservationStatus::Confirmed)]);
        let existing = day.reservations[0].id;
        let err = check_no_conflict(&day, &span("10:30", "11:00"), None).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(id) if id == existing));
    }

    #[test]
    fn adjacent_bookings_do_not_collide() {
        let day = day_with(&[("10:00", "10:45", ReservationStatus::Pending)]);
        assert!(check_no_conflict(&day, &span("10:45", "11:30"), None).is_ok());
        assert!(check_no_conflict(&day, &span("09:15", "10:00"), None).is_ok());
    }

    #[test]
    fn inactive_reservations_do_not_block() {
        let day = day_with(&[
            ("10:00", "11:00", ReservationStatus::Cancelled),
            ("11:00", "12:00", ReservationStatus::Completed),
        ]);
        assert!(check_no_conflict(&day, &span("10:00", "12:00"), None).is_ok());
    }

    #[test]
    fn excluded_reservation_is_ignored() {
        let day = day_with(&[("10:00", "11:00", ReservationStatus::Pending)]);
        let own = day.reservations[0].id;
        assert!(check_no_conflict(&day, &span("10:30", "11:30"), Some(own)).is_ok());
    }

    #[test]
    fn containing_span_conflicts() {
        let day = day_with(&[("10:15", "10:30", ReservationStatus::Pending)]);
        assert!(check_no_conflict(&day, &span("10:00", "11:00"), None).is_err());
    }

    #[test]
    fn busy_spans_merges_across_days() {
        let a = day_with(&[
            ("09:00", "10:00", ReservationStatus::Pending),
            ("13:00", "14:00", ReservationStatus::Cancelled),
        ]);
        let b = day_with(&[("09:30", "10:30", ReservationStatus::Confirmed)]);
        assert_eq!(busy_spans([&a, &b]), vec![span("09:00", "10:30")]);
    }
}
