use std::collections::BTreeMap;
use std::str::FromStr;

use serde::Deserialize;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::reorder::{next_index, plan_move};
use super::{Engine, EngineError};

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCategory {
    pub name: String,
    #[serde(default = "yes")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewService {
    pub name: String,
    pub duration_minutes: u32,
    pub base_price: i64,
    #[serde(default)]
    pub level_prices: BTreeMap<String, i64>,
    pub category_id: Ulid,
    #[serde(default = "yes")]
    pub active: bool,
}

/// Creates an employee, or replaces the one with `id`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEmployee {
    #[serde(default)]
    pub id: Option<Ulid>,
    pub name: String,
    pub level: String,
    #[serde(default = "yes")]
    pub active: bool,
}

/// Opening hours for one weekday. Times may be left out on a closed day.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoursInput {
    #[serde(default)]
    pub open_time: Option<String>,
    #[serde(default)]
    pub close_time: Option<String>,
    #[serde(default)]
    pub closed: bool,
    #[serde(default = "yes")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBlock {
    pub section_id: Ulid,
    pub title: String,
}

/// Drag-and-drop target: a position, and optionally a different bucket.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRequest {
    pub new_index: u32,
    #[serde(default)]
    pub new_bucket_id: Option<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorderFamily {
    Services,
    Categories,
    Blocks,
}

impl FromStr for ReorderFamily {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "services" => Ok(Self::Services),
            "categories" => Ok(Self::Categories),
            "blocks" => Ok(Self::Blocks),
            other => Err(EngineError::validation(format!(
                "unknown reorder family {other:?}: expected services, categories or blocks"
            ))),
        }
    }
}

fn catalog_name(field: &str, value: &str) -> Result<String, EngineError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(EngineError::validation(format!("{field} is required")));
    }
    if value.chars().count() > MAX_NAME_LEN {
        return Err(EngineError::validation(format!("{field} exceeds {MAX_NAME_LEN} characters")));
    }
    Ok(value.to_string())
}

fn hours_time(field: &str, value: Option<&str>) -> Result<ClockTime, EngineError> {
    value
        .ok_or_else(|| EngineError::validation(format!("{field} is required unless the day is closed")))?
        .trim()
        .parse()
        .map_err(|e| EngineError::validation(format!("{field}: {e}")))
}

impl Engine {
    pub async fn create_category(&self, actor: &Actor, input: NewCategory) -> Result<Category, EngineError> {
        let name = catalog_name("name", &input.name)?;
        let _gate = self.write_gate.read().await;
        let mut catalog = self.catalog.write().await;
        let category = Category {
            id: Ulid::new(),
            name,
            order_index: next_index(catalog.categories.values(), ())?,
            active: input.active,
        };
        self.persist_catalog(&mut catalog, Event::CategoryCreated {
            category: category.clone(),
        })
        .await?;
        info!(category_id = %category.id, actor = actor.label(), "category created");
        Ok(category)
    }

    /// Fails with `BucketNotEmpty` while any service still belongs to it.
    pub async fn delete_category(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let mut catalog = self.catalog.write().await;
        if catalog.category(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        if catalog.services_in(id).next().is_some() {
            return Err(EngineError::BucketNotEmpty(id));
        }
        self.persist_catalog(&mut catalog, Event::CategoryDeleted { id }).await?;
        info!(category_id = %id, actor = actor.label(), "category deleted");
        Ok(())
    }

    pub async fn create_service(&self, actor: &Actor, input: NewService) -> Result<Service, EngineError> {
        let name = catalog_name("name", &input.name)?;
        if input.duration_minutes == 0 || input.duration_minutes > MAX_SERVICE_DURATION_MINUTES {
            return Err(EngineError::validation(format!(
                "durationMinutes must be between 1 and {MAX_SERVICE_DURATION_MINUTES}"
            )));
        }
        if input.base_price < 0 || input.level_prices.values().any(|p| *p < 0) {
            return Err(EngineError::validation("prices must not be negative"));
        }

        let _gate = self.write_gate.read().await;
        let mut catalog = self.catalog.write().await;
        if catalog.category(&input.category_id).is_none() {
            return Err(EngineError::NotFound(input.category_id));
        }
        let service = Service {
            id: Ulid::new(),
            name,
            duration_minutes: input.duration_minutes,
            base_price: input.base_price,
            level_prices: input.level_prices,
            category_id: input.category_id,
            order_index: next_index(catalog.services.values(), input.category_id)?,
            active: input.active,
        };
        self.persist_catalog(&mut catalog, Event::ServiceCreated {
            service: service.clone(),
        })
        .await?;
        info!(service_id = %service.id, actor = actor.label(), "service created");
        Ok(service)
    }

    pub async fn delete_service(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let mut catalog = self.catalog.write().await;
        if catalog.service(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        self.persist_catalog(&mut catalog, Event::ServiceDeleted { id }).await?;
        info!(service_id = %id, actor = actor.label(), "service deleted");
        Ok(())
    }

    pub async fn save_employee(&self, actor: &Actor, input: NewEmployee) -> Result<Employee, EngineError> {
        let employee = Employee {
            id: input.id.unwrap_or_else(Ulid::new),
            name: catalog_name("name", &input.name)?,
            level: catalog_name("level", &input.level)?,
            active: input.active,
        };
        let _gate = self.write_gate.read().await;
        let mut catalog = self.catalog.write().await;
        self.persist_catalog(&mut catalog, Event::EmployeeSaved {
            employee: employee.clone(),
        })
        .await?;
        info!(employee_id = %employee.id, actor = actor.label(), "employee saved");
        Ok(employee)
    }

    pub async fn set_business_hours(
        &self,
        actor: &Actor,
        day_of_week: u8,
        input: HoursInput,
    ) -> Result<BusinessHours, EngineError> {
        if day_of_week > 6 {
            return Err(EngineError::validation(format!(
                "dayOfWeek {day_of_week} out of range: expected 0 (Sunday) to 6 (Saturday)"
            )));
        }
        let (open_time, close_time) = if input.closed && input.open_time.is_none() && input.close_time.is_none() {
            (ClockTime::default(), ClockTime::default())
        } else {
            let open = hours_time("openTime", input.open_time.as_deref())?;
            let close = hours_time("closeTime", input.close_time.as_deref())?;
            if !input.closed && open >= close {
                return Err(EngineError::validation(format!("openTime {open} must be before closeTime {close}")));
            }
            (open, close)
        };
        let hours = BusinessHours {
            day_of_week,
            open_time,
            close_time,
            closed: input.closed,
            active: input.active,
        };

        let _gate = self.write_gate.read().await;
        let mut catalog = self.catalog.write().await;
        self.persist_catalog(&mut catalog, Event::BusinessHoursSet { hours }).await?;
        info!(day_of_week, actor = actor.label(), closed = hours.closed, "business hours set");
        Ok(hours)
    }

    pub async fn create_block(&self, actor: &Actor, input: NewBlock) -> Result<ContentBlock, EngineError> {
        let title = catalog_name("title", &input.title)?;
        let _gate = self.write_gate.read().await;
        let mut catalog = self.catalog.write().await;
        let block = ContentBlock {
            id: Ulid::new(),
            section_id: input.section_id,
            title,
            order_index: next_index(catalog.blocks.values(), input.section_id)?,
        };
        self.persist_catalog(&mut catalog, Event::BlockCreated { block: block.clone() })
            .await?;
        info!(block_id = %block.id, actor = actor.label(), "content block created");
        Ok(block)
    }

    pub async fn delete_block(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let mut catalog = self.catalog.write().await;
        if catalog.block(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        self.persist_catalog(&mut catalog, Event::BlockDeleted { id }).await?;
        info!(block_id = %id, actor = actor.label(), "content block deleted");
        Ok(())
    }

    // ── Reordering ───────────────────────────────────────────
    //
    // Each move is planned, logged as one record and applied under the
    // catalog write lock. An empty plan (same position) writes nothing.

    pub async fn move_service(&self, actor: &Actor, id: Ulid, request: MoveRequest) -> Result<Service, EngineError> {
        let _gate = self.write_gate.read().await;
        let mut catalog = self.catalog.write().await;
        if let Some(category_id) = request.new_bucket_id
            && catalog.category(&category_id).is_none()
        {
            return Err(EngineError::NotFound(category_id));
        }
        let placements = plan_move(catalog.services.values(), id, request.new_bucket_id, request.new_index)?;
        let moved = placements.len();
        if moved > 0 {
            self.persist_catalog(&mut catalog, Event::ServicesReordered { placements })
                .await?;
        }
        record_reorder("services", id, moved, actor);
        catalog.service(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn move_category(&self, actor: &Actor, id: Ulid, request: MoveRequest) -> Result<Category, EngineError> {
        if request.new_bucket_id.is_some() {
            return Err(EngineError::validation("categories have no parent bucket"));
        }
        let _gate = self.write_gate.read().await;
        let mut catalog = self.catalog.write().await;
        let placements = plan_move(catalog.categories.values(), id, None, request.new_index)?;
        let moved = placements.len();
        if moved > 0 {
            self.persist_catalog(&mut catalog, Event::CategoriesReordered { placements })
                .await?;
        }
        record_reorder("categories", id, moved, actor);
        catalog.category(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Sections are plain ids, so any target section is accepted.
    pub async fn move_block(&self, actor: &Actor, id: Ulid, request: MoveRequest) -> Result<ContentBlock, EngineError> {
        let _gate = self.write_gate.read().await;
        let mut catalog = self.catalog.write().await;
        let placements = plan_move(catalog.blocks.values(), id, request.new_bucket_id, request.new_index)?;
        let moved = placements.len();
        if moved > 0 {
            self.persist_catalog(&mut catalog, Event::BlocksReordered { placements })
                .await?;
        }
        record_reorder("blocks", id, moved, actor);
        catalog.block(&id).cloned().ok_or(EngineError::NotFound(id))
    }
}

fn record_reorder(family: &'static str, id: Ulid, moved: usize, actor: &Actor) {
    metrics::counter!(crate::observability::REORDERS_TOTAL, "family" => family).increment(1);
    info!(family, item_id = %id, moved, actor = actor.label(), "items reordered");
}
