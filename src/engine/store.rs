use std::collections::{BTreeMap, HashMap};

use ulid::Ulid;

use crate::model::*;

use super::reorder::{apply_placements, plan_removal, OrderedItem};

/// Categories, services, employees, business hours and content blocks.
///
/// Mutated only through `apply`, so replay and live writes share one path.
#[derive(Debug, Default)]
pub struct Catalog {
    pub(super) categories: HashMap<Ulid, Category>,
    pub(super) services: HashMap<Ulid, Service>,
    pub(super) employees: HashMap<Ulid, Employee>,
    /// Keyed by day of week, 0 = Sunday.
    pub(super) hours: BTreeMap<u8, BusinessHours>,
    pub(super) blocks: HashMap<Ulid, ContentBlock>,
}

impl Catalog {
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::CategoryCreated { category } => {
                self.categories.insert(category.id, category.clone());
            }
            Event::CategoryDeleted { id } => remove_closing_gap(&mut self.categories, id),
            Event::ServiceCreated { service } => {
                self.services.insert(service.id, service.clone());
            }
            Event::ServiceDeleted { id } => remove_closing_gap(&mut self.services, id),
            Event::EmployeeSaved { employee } => {
                self.employees.insert(employee.id, employee.clone());
            }
            Event::BusinessHoursSet { hours } => {
                self.hours.insert(hours.day_of_week, *hours);
            }
            Event::BlockCreated { block } => {
                self.blocks.insert(block.id, block.clone());
            }
            Event::BlockDeleted { id } => remove_closing_gap(&mut self.blocks, id),
            Event::CategoriesReordered { placements } => apply_placements(&mut self.categories, placements),
            Event::ServicesReordered { placements } => apply_placements(&mut self.services, placements),
            Event::BlocksReordered { placements } => apply_placements(&mut self.blocks, placements),
            Event::ReservationCreated { .. }
            | Event::ReservationUpdated { .. }
            | Event::ReservationDeleted { .. } => {}
        }
    }

    // ── Lookups ──────────────────────────────────────────────

    pub fn category(&self, id: &Ulid) -> Option<&Category> {
        self.categories.get(id)
    }

    pub fn service(&self, id: &Ulid) -> Option<&Service> {
        self.services.get(id)
    }

    pub fn employee(&self, id: &Ulid) -> Option<&Employee> {
        self.employees.get(id)
    }

    pub fn block(&self, id: &Ulid) -> Option<&ContentBlock> {
        self.blocks.get(id)
    }

    pub fn hours_for(&self, day_of_week: u8) -> Option<&BusinessHours> {
        self.hours.get(&day_of_week)
    }

    pub fn active_service(&self, id: &Ulid) -> Option<&Service> {
        self.services.get(id).filter(|s| s.active)
    }

    pub fn active_employee(&self, id: &Ulid) -> Option<&Employee> {
        self.employees.get(id).filter(|e| e.active)
    }

    /// Active employees sorted by name.
    pub fn active_employees(&self) -> Vec<&Employee> {
        let mut out: Vec<&Employee> = self.employees.values().filter(|e| e.active).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    pub fn services_in(&self, category_id: Ulid) -> impl Iterator<Item = &Service> {
        self.services.values().filter(move |s| s.category_id == category_id)
    }

    /// Display names for a reservation's service and employee.
    pub fn names_for(&self, reservation: &Reservation) -> (Option<String>, Option<String>) {
        (
            self.service(&reservation.service_id).map(|s| s.name.clone()),
            reservation
                .employee_id
                .and_then(|id| self.employee(&id))
                .map(|e| e.name.clone()),
        )
    }

    pub fn details(&self, reservation: Reservation) -> ReservationDetails {
        let (service_name, employee_name) = self.names_for(&reservation);
        ReservationDetails {
            reservation,
            service_name,
            employee_name,
        }
    }

    pub fn view(&self) -> CatalogView {
        CatalogView {
            categories: ordered(self.categories.values()),
            services: ordered(self.services.values()),
            employees: {
                let mut e: Vec<Employee> = self.employees.values().cloned().collect();
                e.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
                e
            },
            business_hours: self.hours.values().copied().collect(),
            blocks: ordered(self.blocks.values()),
        }
    }

    /// Events that recreate the catalog from scratch. Categories precede the
    /// services that reference them.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for category in ordered(self.categories.values()) {
            events.push(Event::CategoryCreated { category });
        }
        for service in ordered(self.services.values()) {
            events.push(Event::ServiceCreated { service });
        }
        for employee in self.employees.values() {
            events.push(Event::EmployeeSaved {
                employee: employee.clone(),
            });
        }
        for hours in self.hours.values() {
            events.push(Event::BusinessHoursSet { hours: *hours });
        }
        for block in ordered(self.blocks.values()) {
            events.push(Event::BlockCreated { block });
        }
        events
    }
}

/// Deleting shifts the rest of the bucket down, so one record covers both.
fn remove_closing_gap<T: OrderedItem>(items: &mut HashMap<Ulid, T>, id: &Ulid) {
    if let Ok(plan) = plan_removal(items.values(), *id) {
        apply_placements(items, &plan);
    }
    items.remove(id);
}

/// Clone and sort by (bucket, position). Ids break ties so output is stable.
fn ordered<'a, T>(items: impl Iterator<Item = &'a T>) -> Vec<T>
where
    T: OrderedItem + Clone + 'a,
    T::Bucket: Ord,
{
    let mut out: Vec<T> = items.cloned().collect();
    out.sort_by(|a, b| {
        a.bucket()
            .cmp(&b.bucket())
            .then(a.order_index().cmp(&b.order_index()))
            .then(a.id().cmp(&b.id()))
    });
    out
}
