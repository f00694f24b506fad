use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

use crate::limits::MINUTES_PER_DAY;

/// Minutes since local midnight.
pub type Minute = u32;

/// Half-open interval `[start, end)` within one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Minute,
    pub end: Minute,
}

impl Span {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> Minute {
        self.end - self.start
    }

    /// Adjacent spans never overlap: `[9:00, 10:00)` and `[10:00, 11:00)` are disjoint.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && self.end > other.start
    }
}

// ── Wall-clock time ──────────────────────────────────────────────

/// A 24h `HH:MM` wall-clock time. Defaults to midnight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockTime(u16);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockTimeParseError(pub String);

impl fmt::Display for ClockTimeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid time {:?}: expected HH:MM (24h)", self.0)
    }
}

impl std::error::Error for ClockTimeParseError {}

impl ClockTime {
    pub fn from_minutes(minutes: Minute) -> Option<Self> {
        (minutes < MINUTES_PER_DAY).then_some(Self(minutes as u16))
    }

    pub fn hm(hour: u32, minute: u32) -> Option<Self> {
        if hour > 23 || minute > 59 {
            return None;
        }
        Self::from_minutes(hour * 60 + minute)
    }

    pub fn minutes(self) -> Minute {
        self.0 as Minute
    }

    /// `None` when the result would cross midnight.
    pub fn plus_minutes(self, minutes: Minute) -> Option<Self> {
        Self::from_minutes(self.minutes() + minutes)
    }

    pub fn to_naive(self) -> chrono::NaiveTime {
        chrono::NaiveTime::from_num_seconds_from_midnight_opt(self.minutes() * 60, 0)
            .unwrap_or(chrono::NaiveTime::MIN)
    }
}

impl FromStr for ClockTime {
    type Err = ClockTimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ClockTimeParseError(s.to_string());
        let bytes = s.as_bytes();
        if bytes.len() != 5 || bytes[2] != b':' {
            return Err(err());
        }
        let digits = [bytes[0], bytes[1], bytes[3], bytes[4]];
        if !digits.iter().all(u8::is_ascii_digit) {
            return Err(err());
        }
        let hour = ((digits[0] - b'0') * 10 + (digits[1] - b'0')) as u32;
        let minute = ((digits[2] - b'0') * 10 + (digits[3] - b'0')) as u32;
        Self::hm(hour, minute).ok_or_else(err)
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl Serialize for ClockTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClockTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl ReservationStatus {
    /// Active reservations block slots; completed and cancelled ones do not.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }

    /// Re-asserting the current status is always allowed.
    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        self == next
            || matches!(
                (self, next),
                (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Completed) | (Confirmed, Cancelled)
            )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    #[default]
    Cash,
    Card,
    Transfer,
}

/// The lock granularity for double-booking: one employee (or nobody) on one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub employee_id: Option<Ulid>,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: Ulid,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: String,
    pub date: NaiveDate,
    pub start_time: ClockTime,
    pub end_time: ClockTime,
    pub service_id: Ulid,
    pub employee_id: Option<Ulid>,
    pub status: ReservationStatus,
    /// Minor currency units.
    pub price: i64,
    pub payment_method: PaymentMethod,
    pub email_notify: bool,
    pub sms_notify: bool,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn span(&self) -> Span {
        Span::new(self.start_time.minutes(), self.end_time.minutes())
    }

    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey {
            employee_id: self.employee_id,
            date: self.date,
        }
    }
}

/// All reservations of one resource-day, sorted by start time.
#[derive(Debug, Clone)]
pub struct DaySchedule {
    pub key: ResourceKey,
    pub reservations: Vec<Reservation>,
}

impl DaySchedule {
    pub fn new(key: ResourceKey) -> Self {
        Self {
            key,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by start time.
    pub fn insert(&mut self, reservation: Reservation) {
        let start = reservation.start_time;
        let pos = self
            .reservations
            .binary_search_by_key(&start, |r| r.start_time)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn get(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    /// Reservations (any status) whose span overlaps the query.
    /// Everything at index >= right_bound starts at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.start_time.minutes() < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.end_time.minutes() > query.start)
    }

    pub fn active_spans(&self) -> impl Iterator<Item = Span> + '_ {
        self.reservations
            .iter()
            .filter(|r| r.status.is_active())
            .map(Reservation::span)
    }
}

// ── Catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: Ulid,
    pub name: String,
    pub order_index: u32,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub duration_minutes: u32,
    pub base_price: i64,
    /// Employee level → price. Levels without an entry pay `base_price`.
    pub level_prices: BTreeMap<String, i64>,
    pub category_id: Ulid,
    pub order_index: u32,
    pub active: bool,
}

impl Service {
    pub fn price_for_level(&self, level: Option<&str>) -> i64 {
        level
            .and_then(|l| self.level_prices.get(l))
            .copied()
            .unwrap_or(self.base_price)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Employee {
    pub id: Ulid,
    pub name: String,
    pub level: String,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessHours {
    /// 0 = Sunday … 6 = Saturday.
    pub day_of_week: u8,
    pub open_time: ClockTime,
    pub close_time: ClockTime,
    pub closed: bool,
    pub active: bool,
}

impl BusinessHours {
    pub fn is_open(&self) -> bool {
        self.active && !self.closed && self.open_time < self.close_time
    }

    pub fn span(&self) -> Span {
        Span::new(self.open_time.minutes(), self.close_time.minutes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentBlock {
    pub id: Ulid,
    pub section_id: Ulid,
    pub title: String,
    pub order_index: u32,
}

/// Where an item sits after a reindex: its bucket and dense position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement<B> {
    pub id: Ulid,
    pub bucket: B,
    pub order_index: u32,
}

/// Opaque, already-authenticated caller identity. Only used for audit logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Actor(Option<String>);

impl Actor {
    pub fn new(id: Option<String>) -> Self {
        Self(id.filter(|s| !s.trim().is_empty()))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }

    pub fn label(&self) -> &str {
        self.0.as_deref().unwrap_or("anonymous")
    }
}

/// WAL record format. One variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CategoryCreated {
        category: Category,
    },
    CategoryDeleted {
        id: Ulid,
    },
    ServiceCreated {
        service: Service,
    },
    ServiceDeleted {
        id: Ulid,
    },
    EmployeeSaved {
        employee: Employee,
    },
    BusinessHoursSet {
        hours: BusinessHours,
    },
    BlockCreated {
        block: ContentBlock,
    },
    BlockDeleted {
        id: Ulid,
    },
    CategoriesReordered {
        placements: Vec<Placement<()>>,
    },
    ServicesReordered {
        placements: Vec<Placement<Ulid>>,
    },
    BlocksReordered {
        placements: Vec<Placement<Ulid>>,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationUpdated {
        previous_key: ResourceKey,
        reservation: Reservation,
    },
    ReservationDeleted {
        id: Ulid,
        key: ResourceKey,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub time: ClockTime,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmployeeSummary {
    pub id: Ulid,
    pub name: String,
    pub level: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityReport {
    pub date: NaiveDate,
    pub slots: Vec<Slot>,
    pub business_hours: Option<BusinessHours>,
    pub service_duration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_employees: Option<Vec<EmployeeSummary>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_reason: Option<String>,
}

/// A reservation joined with the display names of its service and employee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationDetails {
    #[serde(flatten)]
    pub reservation: Reservation,
    pub service_name: Option<String>,
    pub employee_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogView {
    pub categories: Vec<Category>,
    pub services: Vec<Service>,
    pub employees: Vec<Employee>,
    pub business_hours: Vec<BusinessHours>,
    pub blocks: Vec<ContentBlock>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> ClockTime {
        s.parse().unwrap()
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(600, 645);
        let b = Span::new(630, 660);
        let c = Span::new(645, 700);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert_eq!(a.duration(), 45);
    }

    #[test]
    fn clock_time_parse_and_display() {
        assert_eq!(t("09:05").minutes(), 9 * 60 + 5);
        assert_eq!(t("23:59").to_string(), "23:59");
        assert_eq!(ClockTime::hm(7, 0).unwrap().to_string(), "07:00");
    }

    #[test]
    fn clock_time_rejects_malformed() {
        for bad in ["9:00", "24:00", "12:60", "12-30", "ab:cd", "", "12:300", " 9:00"] {
            assert!(bad.parse::<ClockTime>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn clock_time_plus_minutes_stops_at_midnight() {
        assert_eq!(t("17:15").plus_minutes(45), Some(t("18:00")));
        assert_eq!(t("23:30").plus_minutes(30), None);
    }

    #[test]
    fn clock_time_serde_as_string() {
        let json = serde_json::to_string(&t("08:30")).unwrap();
        assert_eq!(json, "\"08:30\"");
        let back: ClockTime = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t("08:30"));
        assert!(serde_json::from_str::<ClockTime>("\"8:30\"").is_err());
    }

    #[test]
    fn status_transitions() {
        use ReservationStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Completed));
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Confirmed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Confirmed));
        assert!(Pending.is_active() && Confirmed.is_active());
        assert!(!Completed.is_active() && !Cancelled.is_active());
    }

    #[test]
    fn service_price_by_level() {
        let mut level_prices = BTreeMap::new();
        level_prices.insert("senior".to_string(), 6000);
        let svc = Service {
            id: Ulid::new(),
            name: "Cut".into(),
            duration_minutes: 45,
            base_price: 4000,
            level_prices,
            category_id: Ulid::new(),
            order_index: 0,
            active: true,
        };
        assert_eq!(svc.price_for_level(Some("senior")), 6000);
        assert_eq!(svc.price_for_level(Some("junior")), 4000);
        assert_eq!(svc.price_for_level(None), 4000);
    }

    fn reservation_at(start: &str, end: &str) -> Reservation {
        let now = Utc::now();
        Reservation {
            id: Ulid::new(),
            customer_name: "Ana".into(),
            customer_email: "ana@example.com".into(),
            customer_phone: "+100".into(),
            date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            start_time: t(start),
            end_time: t(end),
            service_id: Ulid::new(),
            employee_id: None,
            status: ReservationStatus::Pending,
            price: 0,
            payment_method: PaymentMethod::Cash,
            email_notify: false,
            sms_notify: false,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn day_schedule_keeps_start_order() {
        let first = reservation_at("09:00", "09:30");
        let mut ds = DaySchedule::new(first.resource_key());
        ds.insert(reservation_at("14:00", "15:00"));
        ds.insert(first);
        ds.insert(reservation_at("11:00", "11:45"));
        let starts: Vec<_> = ds.reservations.iter().map(|r| r.start_time.to_string()).collect();
        assert_eq!(starts, vec!["09:00", "11:00", "14:00"]);
    }

    #[test]
    fn day_schedule_overlapping_skips_adjacent() {
        let mut ds = DaySchedule::new(reservation_at("09:00", "09:30").resource_key());
        ds.insert(reservation_at("09:00", "10:00"));
        ds.insert(reservation_at("10:30", "11:00"));
        ds.insert(reservation_at("12:00", "13:00"));
        let hits: Vec<_> = ds.overlapping(&Span::new(600, 660)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].start_time, t("10:30"));
    }

    #[test]
    fn day_schedule_remove() {
        let r = reservation_at("09:00", "09:30");
        let id = r.id;
        let mut ds = DaySchedule::new(r.resource_key());
        ds.insert(r);
        assert!(ds.get(&id).is_some());
        assert_eq!(ds.remove(id).map(|r| r.id), Some(id));
        assert!(ds.reservations.is_empty());
        assert!(ds.remove(id).is_none());
    }

    #[test]
    fn actor_label() {
        assert_eq!(Actor::anonymous().label(), "anonymous");
        assert_eq!(Actor::new(Some("  ".into())).label(), "anonymous");
        assert_eq!(Actor::new(Some("admin-7".into())).label(), "admin-7");
    }
}
