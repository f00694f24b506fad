use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::SMS_REMINDER_LEAD_HOURS;
use crate::model::{ClockTime, Reservation, ReservationStatus};

const OUTCOME_CHANNEL_CAPACITY: usize = 256;

/// What a notification needs to know about a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationSnapshot {
    pub id: Ulid,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: String,
    pub date: NaiveDate,
    pub start_time: ClockTime,
    pub end_time: ClockTime,
    pub service_name: Option<String>,
    pub employee_name: Option<String>,
    pub status: ReservationStatus,
    pub price: i64,
    pub email_notify: bool,
    pub sms_notify: bool,
}

impl ReservationSnapshot {
    pub fn new(r: &Reservation, service_name: Option<String>, employee_name: Option<String>) -> Self {
        Self {
            id: r.id,
            customer_name: r.customer_name.clone(),
            customer_email: r.customer_email.clone(),
            customer_phone: r.customer_phone.clone(),
            date: r.date,
            start_time: r.start_time,
            end_time: r.end_time,
            service_name,
            employee_name,
            status: r.status,
            price: r.price,
            email_notify: r.email_notify,
            sms_notify: r.sms_notify,
        }
    }

    fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.start_time.to_naive())
    }
}

/// Reservation lifecycle events, one variant per kind with its required fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum LifecycleEvent {
    Created {
        reservation: ReservationSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    Updated {
        reservation: ReservationSnapshot,
        previous_status: ReservationStatus,
    },
    #[serde(rename_all = "camelCase")]
    Cancelled {
        reservation: ReservationSnapshot,
        previous_status: ReservationStatus,
    },
}

impl LifecycleEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleEvent::Created { .. } => "created",
            LifecycleEvent::Updated { .. } => "updated",
            LifecycleEvent::Cancelled { .. } => "cancelled",
        }
    }

    pub fn reservation(&self) -> &ReservationSnapshot {
        match self {
            LifecycleEvent::Created { reservation }
            | LifecycleEvent::Updated { reservation, .. }
            | LifecycleEvent::Cancelled { reservation, .. } => reservation,
        }
    }

    pub fn previous_status(&self) -> Option<ReservationStatus> {
        match self {
            LifecycleEvent::Created { .. } => None,
            LifecycleEvent::Updated { previous_status, .. }
            | LifecycleEvent::Cancelled { previous_status, .. } => Some(*previous_status),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    CustomerEmail,
    CustomerSms,
    AdminEmail,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::CustomerEmail => "customer_email",
            Channel::CustomerSms => "customer_sms",
            Channel::AdminEmail => "admin_email",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendRequest {
    Email {
        channel: Channel,
        to: String,
        subject: String,
        template: &'static str,
        data: serde_json::Value,
    },
    Sms {
        to: String,
        message: String,
        /// `None` sends right away.
        scheduled_for: Option<NaiveDateTime>,
    },
}

impl SendRequest {
    pub fn channel(&self) -> Channel {
        match self {
            SendRequest::Email { channel, .. } => *channel,
            SendRequest::Sms { .. } => Channel::CustomerSms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationError(pub String);

impl std::fmt::Display for NotificationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification failed: {}", self.0)
    }
}

impl std::error::Error for NotificationError {}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        template: &str,
        data: &serde_json::Value,
    ) -> Result<(), NotificationError>;
}

#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send_sms(
        &self,
        to: &str,
        message: &str,
        scheduled_for: Option<NaiveDateTime>,
    ) -> Result<(), NotificationError>;
}

/// Transport stand-in: writes each email to the log.
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        template: &str,
        _data: &serde_json::Value,
    ) -> Result<(), NotificationError> {
        info!(to, subject, template, "email queued");
        Ok(())
    }
}

/// Transport stand-in: writes each SMS to the log.
pub struct LogSmsSender;

#[async_trait]
impl SmsSender for LogSmsSender {
    async fn send_sms(
        &self,
        to: &str,
        message: &str,
        scheduled_for: Option<NaiveDateTime>,
    ) -> Result<(), NotificationError> {
        info!(to, message, scheduled_for = ?scheduled_for, "sms queued");
        Ok(())
    }
}

/// Result of one send attempt, published on the dispatcher's outcome channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub reservation_id: Ulid,
    pub event: &'static str,
    pub channel: Channel,
    pub result: Result<(), String>,
}

/// Send requests for one lifecycle event.
///
/// `now` is local wall-clock time; SMS reminders land 24h before the
/// appointment, or immediately when that moment has passed.
pub fn plan(event: &LifecycleEvent, admin_email: Option<&str>, now: NaiveDateTime) -> Vec<SendRequest> {
    let r = event.reservation();
    let when = format!("{} {}", r.date, r.start_time);
    let service = r.service_name.as_deref().unwrap_or("your appointment");
    let mut data = serde_json::to_value(r).unwrap_or(serde_json::Value::Null);
    if let (Some(prev), Some(obj)) = (event.previous_status(), data.as_object_mut()) {
        obj.insert("previousStatus".into(), prev.as_str().into());
    }

    let mut requests = Vec::new();
    let (subject, template) = match event {
        LifecycleEvent::Created { .. } => (format!("Reservation received: {service} on {when}"), "reservation_created"),
        LifecycleEvent::Updated { .. } => (format!("Reservation {}: {service} on {when}", r.status), "reservation_updated"),
        LifecycleEvent::Cancelled { .. } => (format!("Reservation cancelled: {service} on {when}"), "reservation_cancelled"),
    };
    if r.email_notify {
        requests.push(SendRequest::Email {
            channel: Channel::CustomerEmail,
            to: r.customer_email.clone(),
            subject,
            template,
            data: data.clone(),
        });
    }

    if r.sms_notify {
        let reminder = |message: String| {
            let at = r.starts_at() - Duration::hours(SMS_REMINDER_LEAD_HOURS);
            SendRequest::Sms {
                to: r.customer_phone.clone(),
                message,
                scheduled_for: (at > now).then_some(at),
            }
        };
        match event {
            LifecycleEvent::Created { .. } => {
                requests.push(reminder(format!("Reminder: {service} on {when}.")));
            }
            LifecycleEvent::Updated { .. } if r.status == ReservationStatus::Confirmed => {
                requests.push(reminder(format!("Confirmed: {service} on {when}.")));
            }
            LifecycleEvent::Cancelled { .. } => requests.push(SendRequest::Sms {
                to: r.customer_phone.clone(),
                message: format!("Your reservation for {service} on {when} was cancelled."),
                scheduled_for: None,
            }),
            LifecycleEvent::Updated { .. } => {}
        }
    }

    if let (LifecycleEvent::Created { .. }, Some(admin)) = (event, admin_email) {
        requests.push(SendRequest::Email {
            channel: Channel::AdminEmail,
            to: admin.to_string(),
            subject: format!("New reservation: {} for {service} on {when}", r.customer_name),
            template: "admin_new_reservation",
            data,
        });
    }
    requests
}

/// Fire-and-forget notification sink.
///
/// `dispatch` returns immediately; every send runs as its own detached task.
/// Failures are logged and published on the outcome channel, never retried.
pub struct NotificationDispatcher {
    email: Arc<dyn EmailSender>,
    sms: Arc<dyn SmsSender>,
    admin_email: Option<String>,
    outcomes: broadcast::Sender<DeliveryOutcome>,
}

impl NotificationDispatcher {
    pub fn new(email: Arc<dyn EmailSender>, sms: Arc<dyn SmsSender>, admin_email: Option<String>) -> Self {
        Self {
            email,
            sms,
            admin_email,
            outcomes: broadcast::channel(OUTCOME_CHANNEL_CAPACITY).0,
        }
    }

    /// Log-only transports.
    pub fn logging(admin_email: Option<String>) -> Self {
        Self::new(Arc::new(LogEmailSender), Arc::new(LogSmsSender), admin_email)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryOutcome> {
        self.outcomes.subscribe()
    }

    pub fn dispatch(&self, event: LifecycleEvent) {
        let now = chrono::Local::now().naive_local();
        let reservation_id = event.reservation().id;
        let kind = event.kind();
        for request in plan(&event, self.admin_email.as_deref(), now) {
            let email = self.email.clone();
            let sms = self.sms.clone();
            let outcomes = self.outcomes.clone();
            tokio::spawn(async move {
                let channel = request.channel();
                let result = match &request {
                    SendRequest::Email { to, subject, template, data, .. } => {
                        email.send_email(to, subject, template, data).await
                    }
                    SendRequest::Sms { to, message, scheduled_for } => {
                        sms.send_sms(to, message, *scheduled_for).await
                    }
                };
                let status = if result.is_ok() { "ok" } else { "error" };
                metrics::counter!(
                    crate::observability::NOTIFICATIONS_TOTAL,
                    "channel" => channel.as_str(),
                    "status" => status
                )
                .increment(1);
                if let Err(e) = &result {
                    warn!(%reservation_id, event = kind, channel = channel.as_str(), "{e}");
                }
                let _ = outcomes.send(DeliveryOutcome {
                    reservation_id,
                    event: kind,
                    channel,
                    result: result.map_err(|e| e.to_string()),
                });
            });
        }
    }
}
