use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::model::*;

use super::availability::availability;
use super::conflict::busy_spans;
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_reservation(&self, id: Ulid) -> Result<ReservationDetails, EngineError> {
        let day = self
            .reservation_key(&id)
            .and_then(|key| self.existing_day(&key))
            .ok_or(EngineError::NotFound(id))?;
        let reservation = day
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        Ok(self.catalog.read().await.details(reservation))
    }

    /// Reservations of every status on `date`, by start time. With an
    /// employee, only that employee's column.
    pub async fn list_reservations(&self, date: NaiveDate, employee_id: Option<Ulid>) -> Vec<ReservationDetails> {
        let mut reservations = Vec::new();
        for day in self.days_on(date, employee_id.map(Some)) {
            reservations.extend(day.read().await.reservations.iter().cloned());
        }
        reservations.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        let catalog = self.catalog.read().await;
        reservations.into_iter().map(|r| catalog.details(r)).collect()
    }

    /// Slot grid for `date`.
    ///
    /// With an employee, only that employee's active reservations block slots;
    /// without one, every active reservation on the date does and the active
    /// employees are listed alongside.
    pub async fn compute_availability(
        &self,
        date: NaiveDate,
        employee_id: Option<Ulid>,
        service_id: Option<Ulid>,
    ) -> Result<AvailabilityReport, EngineError> {
        let started = std::time::Instant::now();
        let (hours, service_duration, available_employees) = {
            let catalog = self.catalog.read().await;
            let service_duration = match service_id {
                Some(id) => Some(
                    catalog
                        .active_service(&id)
                        .ok_or(EngineError::NotFound(id))?
                        .duration_minutes,
                ),
                None => None,
            };
            let available_employees = match employee_id {
                Some(id) => {
                    catalog.active_employee(&id).ok_or(EngineError::NotFound(id))?;
                    None
                }
                None => Some(
                    catalog
                        .active_employees()
                        .into_iter()
                        .map(|e| EmployeeSummary {
                            id: e.id,
                            name: e.name.clone(),
                            level: e.level.clone(),
                        })
                        .collect(),
                ),
            };
            let weekday = date.weekday().num_days_from_sunday() as u8;
            (catalog.hours_for(weekday).copied(), service_duration, available_employees)
        };

        let days = self.days_on(date, employee_id.map(Some));
        let mut guards = Vec::with_capacity(days.len());
        for day in &days {
            guards.push(day.read().await);
        }
        let busy = busy_spans(guards.iter().map(|g| &**g));
        drop(guards);

        let day = availability(hours.as_ref(), &busy, service_duration);
        metrics::counter!(crate::observability::AVAILABILITY_QUERIES_TOTAL).increment(1);
        metrics::histogram!(crate::observability::AVAILABILITY_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        Ok(AvailabilityReport {
            date,
            slots: day.slots,
            business_hours: hours,
            service_duration,
            available_employees,
            closed_reason: day.closed_reason,
        })
    }

    pub async fn catalog_view(&self) -> CatalogView {
        self.catalog.read().await.view()
    }
}
