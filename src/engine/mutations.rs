use chrono::NaiveDate;
use serde::{Deserialize, Deserializer};
use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{LifecycleEvent, ReservationSnapshot};

use super::conflict::{check_no_conflict, now};
use super::store::Catalog;
use super::{apply_to_day, Engine, EngineError, SharedDaySchedule, WalCommand};

/// Body of a create request. Everything is optional at the type level so
/// missing fields surface as validation errors naming the field.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewReservation {
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub date: Option<String>,
    pub start_time: Option<String>,
    /// Defaults to start + service duration.
    pub end_time: Option<String>,
    pub service_id: Option<Ulid>,
    pub employee_id: Option<Ulid>,
    /// Defaults to the service price for the employee's level.
    pub price: Option<i64>,
    pub payment_method: Option<PaymentMethod>,
    pub email_notify: Option<bool>,
    pub sms_notify: Option<bool>,
    pub notes: Option<String>,
}

/// Partial update. Absent fields keep their current value; `employeeId: null`
/// unassigns the reservation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReservationPatch {
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub date: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub service_id: Option<Ulid>,
    #[serde(default, deserialize_with = "present")]
    pub employee_id: Option<Option<Ulid>>,
    pub status: Option<ReservationStatus>,
    pub price: Option<i64>,
    pub payment_method: Option<PaymentMethod>,
    pub email_notify: Option<bool>,
    pub sms_notify: Option<bool>,
    pub notes: Option<String>,
}

/// Distinguishes an explicit `null` (`Some(None)`) from a missing field (`None`).
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

// ── Field validation ─────────────────────────────────────

fn required(field: &str, value: Option<String>) -> Result<String, EngineError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(EngineError::validation(format!("{field} is required"))),
    }
}

fn check_len(field: &str, value: &str, max: usize) -> Result<(), EngineError> {
    if value.chars().count() > max {
        return Err(EngineError::validation(format!("{field} exceeds {max} characters")));
    }
    Ok(())
}

fn check_name(value: &str) -> Result<(), EngineError> {
    check_len("customerName", value, MAX_NAME_LEN)
}

fn check_phone(value: &str) -> Result<(), EngineError> {
    check_len("customerPhone", value, MAX_PHONE_LEN)
}

/// `local@domain.tld`: one `@`, no whitespace, a dot inside the domain.
pub fn validate_email(email: &str) -> Result<(), EngineError> {
    check_len("customerEmail", email, MAX_EMAIL_LEN)?;
    let invalid = || EngineError::validation(format!("invalid email address: {email:?}"));
    if email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) if !host.is_empty() && !tld.is_empty() && !host.ends_with('.') => Ok(()),
        _ => Err(invalid()),
    }
}

/// Strict `YYYY-MM-DD`.
pub fn parse_date(value: &str) -> Result<NaiveDate, EngineError> {
    let value = value.trim();
    if value.len() != 10 {
        return Err(EngineError::validation(format!("invalid date {value:?}: expected YYYY-MM-DD")));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| EngineError::validation(format!("invalid date {value:?}: expected YYYY-MM-DD")))
}

fn parse_time(field: &str, value: &str) -> Result<ClockTime, EngineError> {
    value
        .trim()
        .parse()
        .map_err(|e| EngineError::validation(format!("{field}: {e}")))
}

fn optional_notes(notes: Option<String>) -> Result<Option<String>, EngineError> {
    let notes = notes.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
    if let Some(n) = &notes {
        check_len("notes", n, MAX_NOTES_LEN)?;
    }
    Ok(notes)
}

fn check_price(price: Option<i64>) -> Result<(), EngineError> {
    match price {
        Some(p) if p < 0 => Err(EngineError::validation("price must not be negative")),
        _ => Ok(()),
    }
}

fn check_order(start: ClockTime, end: ClockTime) -> Result<(), EngineError> {
    if start >= end {
        return Err(EngineError::validation(format!("startTime {start} must be before endTime {end}")));
    }
    Ok(())
}

fn end_after(start: ClockTime, duration: Minute) -> Result<ClockTime, EngineError> {
    start
        .plus_minutes(duration)
        .ok_or_else(|| EngineError::validation(format!("a {duration}-minute service starting at {start} runs past midnight")))
}

/// A patch with every present field already parsed and checked.
struct ParsedPatch {
    customer_name: Option<String>,
    customer_email: Option<String>,
    customer_phone: Option<String>,
    date: Option<NaiveDate>,
    start_time: Option<ClockTime>,
    end_time: Option<ClockTime>,
    service_id: Option<Ulid>,
    employee_id: Option<Option<Ulid>>,
    status: Option<ReservationStatus>,
    price: Option<i64>,
    payment_method: Option<PaymentMethod>,
    email_notify: Option<bool>,
    sms_notify: Option<bool>,
    notes: Option<Option<String>>,
}

impl ReservationPatch {
    fn parse(self) -> Result<ParsedPatch, EngineError> {
        let customer_name = self.customer_name.map(|v| required("customerName", Some(v))).transpose()?;
        if let Some(n) = &customer_name {
            check_name(n)?;
        }
        let customer_email = self.customer_email.map(|v| required("customerEmail", Some(v))).transpose()?;
        if let Some(e) = &customer_email {
            validate_email(e)?;
        }
        let customer_phone = self.customer_phone.map(|v| required("customerPhone", Some(v))).transpose()?;
        if let Some(p) = &customer_phone {
            check_phone(p)?;
        }
        check_price(self.price)?;
        Ok(ParsedPatch {
            customer_name,
            customer_email,
            customer_phone,
            date: self.date.as_deref().map(parse_date).transpose()?,
            start_time: self.start_time.as_deref().map(|t| parse_time("startTime", t)).transpose()?,
            end_time: self.end_time.as_deref().map(|t| parse_time("endTime", t)).transpose()?,
            service_id: self.service_id,
            employee_id: self.employee_id,
            status: self.status,
            price: self.price,
            payment_method: self.payment_method,
            email_notify: self.email_notify,
            sms_notify: self.sms_notify,
            notes: self.notes.map(|n| optional_notes(Some(n))).transpose()?,
        })
    }
}

impl ParsedPatch {
    /// Apply to a copy of `current`, re-deriving the end time when the start or
    /// the service actually changes without an explicit end.
    fn merge(&self, current: &Reservation, catalog: &Catalog) -> Result<Reservation, EngineError> {
        let mut next = current.clone();
        if let Some(status) = self.status {
            if !current.status.can_transition_to(status) {
                return Err(EngineError::InvalidTransition {
                    from: current.status,
                    to: status,
                });
            }
            next.status = status;
        }
        if let Some(v) = &self.customer_name {
            next.customer_name = v.clone();
        }
        if let Some(v) = &self.customer_email {
            next.customer_email = v.clone();
        }
        if let Some(v) = &self.customer_phone {
            next.customer_phone = v.clone();
        }
        if let Some(v) = self.date {
            next.date = v;
        }
        if let Some(v) = self.start_time {
            next.start_time = v;
        }
        if let Some(v) = self.payment_method {
            next.payment_method = v;
        }
        if let Some(v) = self.email_notify {
            next.email_notify = v;
        }
        if let Some(v) = self.sms_notify {
            next.sms_notify = v;
        }
        if let Some(v) = &self.notes {
            next.notes = v.clone();
        }
        if let Some(v) = self.price {
            next.price = v;
        }

        let service_changed = self.service_id.is_some_and(|s| s != current.service_id);
        if let Some(service_id) = self.service_id
            && service_changed
        {
            catalog
                .active_service(&service_id)
                .ok_or(EngineError::NotFound(service_id))?;
            next.service_id = service_id;
        }
        if let Some(employee_id) = self.employee_id {
            if let Some(eid) = employee_id
                && employee_id != current.employee_id
            {
                catalog.active_employee(&eid).ok_or(EngineError::NotFound(eid))?;
            }
            next.employee_id = employee_id;
        }

        // A new service brings its own duration. A moved start keeps the
        // booked length, which may have been set by hand.
        let start_changed = next.start_time != current.start_time;
        next.end_time = match self.end_time {
            Some(end) => end,
            None if service_changed => {
                let duration = catalog
                    .service(&next.service_id)
                    .map(|s| s.duration_minutes)
                    .unwrap_or_else(|| current.span().duration());
                end_after(next.start_time, duration)?
            }
            None if start_changed => end_after(next.start_time, current.span().duration())?,
            None => current.end_time,
        };
        check_order(next.start_time, next.end_time)?;
        next.updated_at = now();
        Ok(next)
    }
}

/// Date, time or employee differ, so the no-overlap rule must be re-checked.
fn moved(a: &Reservation, b: &Reservation) -> bool {
    a.date != b.date || a.start_time != b.start_time || a.end_time != b.end_time || a.employee_id != b.employee_id
}

fn reject_conflict(day: &DaySchedule, span: &Span, exclude: Option<Ulid>) -> Result<(), EngineError> {
    check_no_conflict(day, span, exclude).inspect_err(|e| {
        if let EngineError::Conflict(existing) = e {
            metrics::counter!(crate::observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
            debug!(%existing, date = %day.key.date, "slot taken");
        }
    })
}

fn check_capacity(day: &DaySchedule) -> Result<(), EngineError> {
    if day.reservations.len() >= MAX_RESERVATIONS_PER_DAY {
        return Err(EngineError::LimitExceeded("too many reservations on this day"));
    }
    Ok(())
}

impl Engine {
    pub async fn create_reservation(&self, actor: &Actor, input: NewReservation) -> Result<Reservation, EngineError> {
        let customer_name = required("customerName", input.customer_name)?;
        check_name(&customer_name)?;
        let customer_email = required("customerEmail", input.customer_email)?;
        validate_email(&customer_email)?;
        let customer_phone = required("customerPhone", input.customer_phone)?;
        check_phone(&customer_phone)?;
        let date = parse_date(&required("date", input.date)?)?;
        let start_time = parse_time("startTime", &required("startTime", input.start_time)?)?;
        let end_time = input.end_time.as_deref().map(|t| parse_time("endTime", t)).transpose()?;
        if let Some(end) = end_time {
            check_order(start_time, end)?;
        }
        let service_id = input
            .service_id
            .ok_or_else(|| EngineError::validation("serviceId is required"))?;
        check_price(input.price)?;
        let notes = optional_notes(input.notes)?;

        let (end_time, default_price) = {
            let catalog = self.catalog.read().await;
            let service = catalog
                .active_service(&service_id)
                .ok_or(EngineError::NotFound(service_id))?;
            let level = match input.employee_id {
                Some(eid) => Some(
                    catalog
                        .active_employee(&eid)
                        .ok_or(EngineError::NotFound(eid))?
                        .level
                        .as_str(),
                ),
                None => None,
            };
            let end = match end_time {
                Some(end) => end,
                None => end_after(start_time, service.duration_minutes)?,
            };
            (end, service.price_for_level(level))
        };

        let ts = now();
        let reservation = Reservation {
            id: Ulid::new(),
            customer_name,
            customer_email,
            customer_phone,
            date,
            start_time,
            end_time,
            service_id,
            employee_id: input.employee_id,
            status: ReservationStatus::Pending,
            price: input.price.unwrap_or(default_price),
            payment_method: input.payment_method.unwrap_or_default(),
            email_notify: input.email_notify.unwrap_or(true),
            sms_notify: input.sms_notify.unwrap_or(false),
            notes,
            created_at: ts,
            updated_at: ts,
        };

        {
            let _gate = self.write_gate.read().await;
            let day = self.day_schedule(reservation.resource_key());
            let mut guard = day.write().await;
            check_capacity(&guard)?;
            reject_conflict(&guard, &reservation.span(), None)?;
            let event = Event::ReservationCreated {
                reservation: reservation.clone(),
            };
            self.persist_and_apply(&mut guard, &event).await?;
        }

        metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        info!(
            reservation_id = %reservation.id,
            actor = actor.label(),
            date = %reservation.date,
            start = %reservation.start_time,
            employee_id = ?reservation.employee_id,
            "reservation created"
        );
        let snapshot = self.snapshot(&reservation).await;
        self.notifier.dispatch(LifecycleEvent::Created { reservation: snapshot });
        Ok(reservation)
    }

    pub async fn update_reservation(
        &self,
        actor: &Actor,
        id: Ulid,
        patch: ReservationPatch,
    ) -> Result<Reservation, EngineError> {
        let patch = patch.parse()?;
        let _gate = self.write_gate.read().await;

        // Retries only when the record moved while both days were relocked.
        // A deleted record ends the loop with NotFound.
        loop {
            let (mut guard, current) = self.resolve_reservation_write(&id).await?;
            let updated = {
                let catalog = self.catalog.read().await;
                patch.merge(&current, &catalog)?
            };
            let check = moved(&current, &updated) && updated.status.is_active();
            let old_key = guard.key;
            let new_key = updated.resource_key();
            let event = Event::ReservationUpdated {
                previous_key: old_key,
                reservation: updated.clone(),
            };

            if new_key == old_key {
                if check {
                    reject_conflict(&guard, &updated.span(), Some(id))?;
                }
                self.persist_and_apply(&mut guard, &event).await?;
            } else {
                // Lock both resource-days in key order.
                let target: SharedDaySchedule = self.day_schedule(new_key);
                let (mut source, mut dest) = if old_key < new_key {
                    let dest = target.write_owned().await;
                    (guard, dest)
                } else {
                    drop(guard);
                    let dest = target.write_owned().await;
                    let Some(day) = self.existing_day(&old_key) else {
                        continue;
                    };
                    let source = day.write_owned().await;
                    if source.get(&id) != Some(&current) {
                        // Changed underneath us while relocking.
                        continue;
                    }
                    (source, dest)
                };
                check_capacity(&dest)?;
                if check {
                    reject_conflict(&dest, &updated.span(), Some(id))?;
                }
                self.wal_append(&event).await?;
                source.remove(id);
                apply_to_day(&mut dest, &event, &self.reservation_index);
            }

            metrics::counter!(crate::observability::RESERVATIONS_UPDATED_TOTAL).increment(1);
            info!(
                reservation_id = %id,
                actor = actor.label(),
                status = %updated.status,
                previous_status = %current.status,
                "reservation updated"
            );
            if updated.status != current.status {
                let snapshot = self.snapshot(&updated).await;
                self.notifier.dispatch(LifecycleEvent::Updated {
                    reservation: snapshot,
                    previous_status: current.status,
                });
            }
            return Ok(updated);
        }
    }

    /// Removes the reservation and returns it as it was, joined with its
    /// service and employee names.
    pub async fn delete_reservation(&self, actor: &Actor, id: Ulid) -> Result<ReservationDetails, EngineError> {
        let details = {
            let _gate = self.write_gate.read().await;
            let (mut guard, existing) = self.resolve_reservation_write(&id).await?;
            let details = self.catalog.read().await.details(existing);
            let event = Event::ReservationDeleted { id, key: guard.key };
            self.persist_and_apply(&mut guard, &event).await?;
            details
        };

        let previous_status = details.reservation.status;
        metrics::counter!(crate::observability::RESERVATIONS_DELETED_TOTAL).increment(1);
        info!(reservation_id = %id, actor = actor.label(), %previous_status, "reservation deleted");

        let mut snapshot = ReservationSnapshot::new(
            &details.reservation,
            details.service_name.clone(),
            details.employee_name.clone(),
        );
        snapshot.status = ReservationStatus::Cancelled;
        self.notifier.dispatch(LifecycleEvent::Cancelled {
            reservation: snapshot,
            previous_status,
        });
        Ok(details)
    }

    pub(super) async fn snapshot(&self, reservation: &Reservation) -> ReservationSnapshot {
        let (service_name, employee_name) = self.catalog.read().await.names_for(reservation);
        ReservationSnapshot::new(reservation, service_name, employee_name)
    }

    /// Rewrite the WAL as the minimal event set for the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;
        let mut events = self.catalog.read().await.snapshot_events();

        let mut days: Vec<(ResourceKey, SharedDaySchedule)> =
            self.days.iter().map(|e| (*e.key(), e.value().clone())).collect();
        days.sort_by_key(|(k, _)| *k);
        for (_, day) in &days {
            let guard = day.read().await;
            events.extend(guard.reservations.iter().map(|r| Event::ReservationCreated {
                reservation: r.clone(),
            }));
        }
        // No writer can hold a day lock while we hold the gate.
        self.days
            .retain(|_, day| day.try_read().map(|g| !g.reservations.is_empty()).unwrap_or(true));

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!(events = count, "WAL compacted");
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_format() {
        for ok in ["a@b.co", "first.last+tag@salon.example.com"] {
            assert!(validate_email(ok).is_ok(), "{ok}");
        }
        for bad in ["", "plain", "@b.co", "a@b", "a@.co", "a@b.", "a b@c.de", "a@b@c.de", "a@b..co"] {
            assert!(validate_email(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn date_format_is_strict() {
        assert_eq!(parse_date("2026-06-10").unwrap(), NaiveDate::from_ymd_opt(2026, 6, 10).unwrap());
        for bad in ["2026-6-10", "10/06/2026", "2026-02-30", "", "tomorrow"] {
            assert!(matches!(parse_date(bad), Err(EngineError::Validation(_))), "{bad}");
        }
    }

    #[test]
    fn missing_required_field_names_it() {
        let err = required("customerName", Some("   ".into())).unwrap_err();
        assert_eq!(err.to_string(), "invalid input: customerName is required");
    }

    #[test]
    fn patch_distinguishes_null_from_absent() {
        let absent: ReservationPatch = serde_json::from_str("{}").unwrap();
        assert_eq!(absent.employee_id, None);
        let cleared: ReservationPatch = serde_json::from_str(r#"{"employeeId":null}"#).unwrap();
        assert_eq!(cleared.employee_id, Some(None));
        let id = Ulid::new();
        let set: ReservationPatch = serde_json::from_str(&format!(r#"{{"employeeId":"{id}"}}"#)).unwrap();
        assert_eq!(set.employee_id, Some(Some(id)));
    }

    #[test]
    fn end_time_past_midnight_rejected() {
        let start: ClockTime = "23:30".parse().unwrap();
        assert!(end_after(start, 60).is_err());
        assert_eq!(end_after(start, 29).unwrap().to_string(), "23:59");
    }
}
