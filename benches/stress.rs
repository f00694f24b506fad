use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use ulid::Ulid;

use salond::engine::{Engine, EngineError, HoursInput, NewCategory, NewEmployee, NewReservation, NewService};
use salond::model::{Actor, ClockTime};
use salond::notify::NotificationDispatcher;

/// Half-hour slots between 09:00 and 18:00.
const SLOTS_PER_DAY: u32 = 18;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

struct Salon {
    engine: Arc<Engine>,
    service: Ulid,
    employees: Vec<Ulid>,
}

fn bench_wal_path(phase: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("salond_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(format!("{phase}.wal"))
}

async fn setup(phase: &str, n_employees: usize) -> Salon {
    let engine = Arc::new(
        Engine::new(bench_wal_path(phase), Arc::new(NotificationDispatcher::logging(None))).unwrap(),
    );
    let actor = Actor::new(Some("bench".into()));
    let category = engine
        .create_category(&actor, NewCategory { name: "Hair".into(), active: true })
        .await
        .unwrap();
    let service = engine
        .create_service(
            &actor,
            NewService {
                name: "Cut".into(),
                duration_minutes: 30,
                base_price: 3000,
                level_prices: BTreeMap::new(),
                category_id: category.id,
                active: true,
            },
        )
        .await
        .unwrap();
    let mut employees = Vec::new();
    for i in 0..n_employees {
        let e = engine
            .save_employee(
                &actor,
                NewEmployee { id: None, name: format!("Stylist {i}"), level: "junior".into(), active: true },
            )
            .await
            .unwrap();
        employees.push(e.id);
    }
    for day in 0..7 {
        engine
            .set_business_hours(
                &actor,
                day,
                HoursInput {
                    open_time: Some("09:00".into()),
                    close_time: Some("18:00".into()),
                    closed: false,
                    active: true,
                },
            )
            .await
            .unwrap();
    }
    Salon { engine, service: service.id, employees }
}

/// The `n`th half-hour slot counted from 2026-01-01 09:00.
fn slot(n: u32) -> (String, String) {
    let date = NaiveDate::from_ymd_opt(2026, 1, 1)
        .unwrap()
        .checked_add_days(Days::new((n / SLOTS_PER_DAY) as u64))
        .unwrap();
    let start = ClockTime::from_minutes(9 * 60 + (n % SLOTS_PER_DAY) * 30).unwrap();
    (date.to_string(), start.to_string())
}

fn booking(service: Ulid, employee: Ulid, n: u32) -> NewReservation {
    let (date, start) = slot(n);
    NewReservation {
        customer_name: Some("Bench Customer".into()),
        customer_email: Some("bench@example.com".into()),
        customer_phone: Some("+10000000000".into()),
        date: Some(date),
        start_time: Some(start),
        service_id: Some(service),
        employee_id: Some(employee),
        email_notify: Some(false),
        ..Default::default()
    }
}

async fn phase1_sequential() {
    let salon = setup("sequential", 1).await;
    let actor = Actor::anonymous();
    let employee = salon.employees[0];

    let n = 2000;
    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        salon
            .engine
            .create_reservation(&actor, booking(salon.service, employee, i))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("create latency", &mut latencies);
}

async fn phase2_concurrent() {
    let n_tasks = 10;
    let n_per_task = 200;
    let salon = setup("concurrent", n_tasks).await;

    let start = Instant::now();
    let mut handles = Vec::new();

    for i in 0..n_tasks {
        let engine = salon.engine.clone();
        let service = salon.service;
        let employee = salon.employees[i];
        handles.push(tokio::spawn(async move {
            let actor = Actor::anonymous();
            for j in 0..n_per_task {
                engine
                    .create_reservation(&actor, booking(service, employee, j))
                    .await
                    .unwrap();
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks as u32 * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} employees x {n_per_task} reservations = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_availability_under_load() {
    let salon = setup("availability", 4).await;
    let actor = Actor::anonymous();

    // Pre-populate the first two weeks for every employee, leaving gaps.
    for &employee in &salon.employees {
        for n in (0..SLOTS_PER_DAY * 14).step_by(2) {
            salon
                .engine
                .create_reservation(&actor, booking(salon.service, employee, n))
                .await
                .unwrap();
        }
    }

    let writer = {
        let engine = salon.engine.clone();
        let service = salon.service;
        let employees = salon.employees.clone();
        tokio::spawn(async move {
            let actor = Actor::anonymous();
            let mut written = 0u32;
            for n in (1..SLOTS_PER_DAY * 14).step_by(2) {
                for &employee in &employees {
                    if engine.create_reservation(&actor, booking(service, employee, n)).await.is_ok() {
                        written += 1;
                    }
                }
            }
            written
        })
    };

    let n = 1000;
    let mut latencies = Vec::with_capacity(n);
    for i in 0..n {
        let (date, _) = slot((i as u32 % 14) * SLOTS_PER_DAY);
        let date = salond::engine::parse_date(&date).unwrap();
        let employee = (i % 2 == 0).then(|| salon.employees[i % salon.employees.len()]);
        let t = Instant::now();
        salon
            .engine
            .compute_availability(date, employee, Some(salon.service))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    let written = writer.await.unwrap();
    println!("  {written} concurrent writes during reads");
    print_latency("availability latency", &mut latencies);
}

async fn phase4_contended_slot() {
    let salon = setup("contended", 1).await;
    let n_tasks = 200;
    let employee = salon.employees[0];

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let engine = salon.engine.clone();
        let input = booking(salon.service, employee, 0);
        handles.push(tokio::spawn(async move {
            engine.create_reservation(&Actor::anonymous(), input).await
        }));
    }

    let (mut ok, mut conflicts) = (0, 0);
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    let elapsed = start.elapsed();
    assert_eq!(ok, 1, "exactly one writer should win the slot");
    println!(
        "  {n_tasks} writers on one slot: {ok} won, {conflicts} conflicts in {:.2}ms",
        elapsed.as_secs_f64() * 1000.0
    );
}

#[tokio::main]
async fn main() {
    println!("=== salond stress benchmark ===\n");

    // Each phase uses its own WAL to avoid interference

    println!("[phase 1] sequential create throughput");
    phase1_sequential().await;

    println!("\n[phase 2] concurrent create throughput");
    phase2_concurrent().await;

    println!("\n[phase 3] availability latency under write load");
    phase3_availability_under_load().await;

    println!("\n[phase 4] contended slot");
    phase4_contended_slot().await;

    println!("\n=== benchmark complete ===");
}
