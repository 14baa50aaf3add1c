use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use keyturn::limits::DEFAULT_PAYMENT_GRACE_MS;
use keyturn::tenant::TenantManager;
use keyturn::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("keyturn_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, DEFAULT_PAYMENT_GRACE_MS));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "keyturn".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, db: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(db)
        .user("keyturn")
        .password("keyturn");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &tokio_postgres::Client, sql: &str) -> SqlState {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().cloned().unwrap_or_else(|| panic!("no SQLSTATE on {err}"))
}

/// RFC 3339 timestamp `days` from now at 10:00 UTC.
fn day(days: i64) -> String {
    let d = (Utc::now() + Duration::days(days)).date_naive();
    format!("{d}T10:00:00Z")
}

struct Fleet {
    location: Ulid,
    vehicle: Ulid,
}

async fn seed(client: &tokio_postgres::Client, mode: &str) -> Fleet {
    let location = Ulid::new();
    let vehicle = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO locations (id, name, kind, delivery_fee) VALUES ('{location}', 'Gueliz', 'city', 0)"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO vehicles (id, name, rate_per_day, deposit, min_rental_days, confirmation) \
             VALUES ('{vehicle}', 'Dacia Logan', 500, 3000, 1, '{mode}')"
        ))
        .await
        .unwrap();
    Fleet { location, vehicle }
}

fn reserve_sql(f: &Fleet, id: Ulid, from: i64, to: i64) -> String {
    format!(
        "INSERT INTO reservations (id, vehicle_id, pickup_at, return_at, pickup_location, dropoff_location, phone, age) \
         VALUES ('{id}', '{}', '{}', '{}', '{}', '{}', '0612345678', 30)",
        f.vehicle,
        day(from),
        day(to),
        f.location,
        f.location
    )
}

async fn status(client: &tokio_postgres::Client, id: Ulid) -> (String, String) {
    let r = rows(client, &format!("SELECT * FROM reservations WHERE id = '{id}'")).await;
    assert_eq!(r.len(), 1);
    (
        r[0].get("status").unwrap().to_string(),
        r[0].get("hold").unwrap().to_string(),
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn manual_request_conflict_and_rejection() {
    let addr = start_test_server().await;
    let client = connect(addr, "manual").await;
    let fleet = seed(&client, "manual").await;

    let first = Ulid::new();
    client.batch_execute(&reserve_sql(&fleet, first, 10, 13)).await.unwrap();
    assert_eq!(status(&client, first).await, ("awaiting-owner".into(), "authorized".into()));

    let r = rows(&client, &format!("SELECT * FROM reservations WHERE id = '{first}'")).await;
    assert_eq!(r[0].get("total"), Some("1500.00"));
    assert!(r[0].get("owner_decision_deadline").is_some());

    // Overlapping request loses and names the winner.
    let err = client
        .simple_query(&reserve_sql(&fleet, Ulid::new(), 12, 15))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::EXCLUSION_VIOLATION));
    assert!(err.to_string().contains(&first.to_string()));

    let blocked = rows(&client, &format!("SELECT * FROM blocked WHERE vehicle_id = '{}'", fleet.vehicle)).await;
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].get("days"), Some("3"));

    client
        .batch_execute(&format!(
            "INSERT INTO decisions (reservation_id, decision) VALUES ('{first}', 'reject')"
        ))
        .await
        .unwrap();
    assert_eq!(status(&client, first).await, ("rejected".into(), "released".into()));
    let blocked = rows(&client, &format!("SELECT * FROM blocked WHERE vehicle_id = '{}'", fleet.vehicle)).await;
    assert!(blocked.is_empty());

    // Dates are free again.
    client.batch_execute(&reserve_sql(&fleet, Ulid::new(), 12, 15)).await.unwrap();
}

#[tokio::test]
async fn instant_booking_paid_and_cancelled() {
    let addr = start_test_server().await;
    let client = connect(addr, "instant").await;
    let fleet = seed(&client, "instant").await;

    let id = Ulid::new();
    client.batch_execute(&reserve_sql(&fleet, id, 5, 7)).await.unwrap();
    assert_eq!(status(&client, id).await, ("pending-payment".into(), "none".into()));

    client
        .batch_execute(&format!("INSERT INTO payments (reservation_id) VALUES ('{id}')"))
        .await
        .unwrap();
    assert_eq!(status(&client, id).await, ("confirmed".into(), "captured".into()));

    // Owner decisions make no sense on an instant booking.
    let code = sqlstate(
        &client,
        &format!("INSERT INTO decisions (reservation_id, decision) VALUES ('{id}', 'accept')"),
    )
    .await;
    assert_eq!(code, SqlState::OBJECT_NOT_IN_PREREQUISITE_STATE);

    // Delisting refused while the booking holds its dates.
    let code = sqlstate(&client, &format!("DELETE FROM vehicles WHERE id = '{}'", fleet.vehicle)).await;
    assert_eq!(code, SqlState::OBJECT_NOT_IN_PREREQUISITE_STATE);

    client
        .batch_execute(&format!(
            "INSERT INTO cancellations (reservation_id, party) VALUES ('{id}', 'renter')"
        ))
        .await
        .unwrap();
    assert_eq!(status(&client, id).await.0, "cancelled");
    client
        .batch_execute(&format!("DELETE FROM vehicles WHERE id = '{}'", fleet.vehicle))
        .await
        .unwrap();
    assert!(rows(&client, "SELECT * FROM vehicles").await.is_empty());
}

#[tokio::test]
async fn availability_and_quote() {
    let addr = start_test_server().await;
    let client = connect(addr, "calendar").await;
    let fleet = seed(&client, "instant").await;
    client.batch_execute(&reserve_sql(&fleet, Ulid::new(), 10, 13)).await.unwrap();

    let start = (Utc::now() + Duration::days(1)).date_naive();
    let end = (Utc::now() + Duration::days(30)).date_naive();
    let free = rows(
        &client,
        &format!(
            "SELECT * FROM availability WHERE vehicle_id = '{}' AND start >= '{start}' AND \"end\" <= '{end}'",
            fleet.vehicle
        ),
    )
    .await;
    assert_eq!(free.len(), 2);
    assert_eq!(free[0].get("start"), Some(start.to_string().as_str()));
    assert_eq!(free[1].get("end"), Some(end.to_string().as_str()));

    let quote = rows(
        &client,
        &format!(
            "SELECT * FROM quote WHERE vehicle_id = '{}' AND pickup_at = '{}' AND return_at = '{}' \
             AND pickup_location = '{}' AND dropoff_location = '{}'",
            fleet.vehicle,
            day(40),
            day(44),
            fleet.location,
            fleet.location
        ),
    )
    .await;
    assert_eq!(quote.len(), 1);
    assert_eq!(quote[0].get("days"), Some("4"));
    assert_eq!(quote[0].get("total"), Some("2000.00"));
    assert_eq!(quote[0].get("deposit"), Some("3000.00"));
}

#[tokio::test]
async fn input_errors_carry_sqlstates() {
    let addr = start_test_server().await;
    let client = connect(addr, "errors").await;
    let fleet = seed(&client, "manual").await;

    let underage = reserve_sql(&fleet, Ulid::new(), 3, 5).replace(", 30)", ", 17)");
    assert_eq!(sqlstate(&client, &underage).await, SqlState::INVALID_PARAMETER_VALUE);

    let missing = format!("SELECT * FROM reservations WHERE id = '{}'", Ulid::new());
    assert_eq!(sqlstate(&client, &missing).await, SqlState::RAISE_EXCEPTION);

    assert_eq!(sqlstate(&client, "SELECT * FROM nowhere").await, SqlState::SYNTAX_ERROR);
}

#[tokio::test]
async fn databases_are_separate_tenants() {
    let addr = start_test_server().await;
    let a = connect(addr, "agency_a").await;
    let b = connect(addr, "agency_b").await;
    seed(&a, "instant").await;

    assert_eq!(rows(&a, "SELECT * FROM vehicles").await.len(), 1);
    assert!(rows(&b, "SELECT * FROM vehicles").await.is_empty());
}
