use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use slotbook::auth::Operators;
use slotbook::engine::Engine;
use slotbook::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::open(&dir.join("slotbook.wal"), Duration::from_secs(5)).unwrap());
    let operators = Arc::new(Operators::new(["admin"]));

    let engine2 = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine2.clone();
            let operators = operators.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, operators, "slotbook".to_string(), None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect(addr: SocketAddr, user: &str) -> Client {
    let mut config = Config::new();
    config
        .host(&addr.ip().to_string())
        .port(addr.port())
        .dbname("slotbook")
        .user(user)
        .password("slotbook");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
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

async fn affected(client: &Client, sql: &str) -> u64 {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .find_map(|m| match m {
            SimpleQueryMessage::CommandComplete(n) => Some(n),
            _ => None,
        })
        .unwrap()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

async fn create_slot(client: &Client, date: &str, start: &str, end: &str, capacity: u32) -> i64 {
    let created = rows(
        client,
        &format!(
            "INSERT INTO slots (date, time_start, time_end, capacity) VALUES ('{date}', '{start}', '{end}', {capacity}) RETURNING *"
        ),
    )
    .await;
    assert_eq!(created.len(), 1);
    created[0].get("id").unwrap().parse().unwrap()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn operator_creates_slot_and_user_books_it() {
    let (addr, _engine) = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let alice = connect(addr, "alice").await;

    let sid = create_slot(&admin, "2025-09-21", "12:00", "13:00", 1).await;

    let booked = rows(&alice, &format!("INSERT INTO bookings (slot_id, note) VALUES ({sid}, 'ring') RETURNING *")).await;
    assert_eq!(booked.len(), 1);
    assert_eq!(booked[0].get("user_id"), Some("alice"));
    assert_eq!(booked[0].get("status"), Some("confirmed"));
    assert_eq!(booked[0].get("note"), Some("ring"));

    let slots = rows(&alice, "SELECT * FROM slots WHERE date = '2025-09-21'").await;
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].get("booked_count"), Some("1"));
    assert_eq!(slots[0].get("remaining"), Some("0"));
    assert_eq!(slots[0].get("time_start"), Some("12:00:00"));
    assert_eq!(slots[0].get("zone"), None);
}

#[tokio::test]
async fn full_slot_reports_capacity_error() {
    let (addr, _engine) = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let bob = connect(addr, "bob").await;

    let sid = create_slot(&admin, "2025-09-21", "09:00", "10:00", 1).await;
    assert_eq!(affected(&bob, &format!("INSERT INTO bookings (slot_id) VALUES ({sid})")).await, 1);

    assert_eq!(sqlstate(&bob, &format!("INSERT INTO bookings (slot_id) VALUES ({sid})")).await, "53400");
    assert_eq!(sqlstate(&bob, "INSERT INTO bookings (slot_id) VALUES (999)").await, "P0002");
    assert!(rows(&bob, "SELECT * FROM bookable_slots").await.is_empty());
    assert!(rows(&bob, "SELECT * FROM bookable_days").await.is_empty());
}

#[tokio::test]
async fn privileged_statements_need_an_operator() {
    let (addr, engine) = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let carol = connect(addr, "carol").await;

    assert_eq!(
        sqlstate(&carol, "INSERT INTO slots (date, time_start, time_end, capacity) VALUES ('2025-09-21', '09:00', '10:00', 2)").await,
        "42501"
    );
    assert!(engine.list_slots(Default::default()).await.is_empty());

    let sid = create_slot(&admin, "2025-09-21", "09:00", "10:00", 2).await;
    let booking = rows(&carol, &format!("INSERT INTO bookings (slot_id) VALUES ({sid}) RETURNING *")).await;
    let bid: i64 = booking[0].get("id").unwrap().parse().unwrap();

    let cancel = format!("UPDATE bookings SET status = 'cancelled' WHERE id = {bid}");
    assert_eq!(sqlstate(&carol, &cancel).await, "42501");
    assert_eq!(affected(&admin, &cancel).await, 1);
    assert_eq!(affected(&admin, &cancel).await, 0);

    let after = rows(&carol, &format!("SELECT * FROM bookings WHERE id = {bid}")).await;
    assert_eq!(after[0].get("status"), Some("cancelled"));
    assert_eq!(engine.get_slot(sid).await.unwrap().booked_count, 0);
}

#[tokio::test]
async fn invalid_and_malformed_statements_map_to_sqlstate() {
    let (addr, _engine) = start_test_server().await;
    let admin = connect(addr, "admin").await;

    assert_eq!(
        sqlstate(&admin, "INSERT INTO slots (date, time_start, time_end, capacity) VALUES ('2025-09-21', '10:00', '09:00', 1)").await,
        "22023"
    );
    assert_eq!(sqlstate(&admin, "UPDATE bookings SET status = 'cancelled' WHERE id = 42").await, "P0002");
    assert_eq!(sqlstate(&admin, "SELEKT * FROM slots").await, "42601");
    assert_eq!(sqlstate(&admin, "SELECT * FROM resources").await, "42601");
}

#[tokio::test]
async fn bookings_for_slot_and_bookable_days() {
    let (addr, _engine) = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let dave = connect(addr, "dave").await;

    let a = create_slot(&admin, "2025-09-22", "08:00", "09:00", 2).await;
    let b = create_slot(&admin, "2025-09-23", "08:00", "09:00", 1).await;
    affected(&dave, &format!("INSERT INTO bookings (slot_id) VALUES ({a})")).await;
    let for_eve = format!("INSERT INTO bookings (slot_id, user_id) VALUES ({a}, 'eve')");
    assert_eq!(sqlstate(&dave, &for_eve).await, "42501");
    affected(&admin, &for_eve).await;
    affected(&dave, &format!("INSERT INTO bookings (slot_id) VALUES ({b})")).await;

    let for_a = rows(&dave, &format!("SELECT * FROM bookings WHERE slot_id = {a}")).await;
    let users: Vec<_> = for_a.iter().map(|r| r.get("user_id").unwrap().to_string()).collect();
    assert_eq!(users, vec!["dave", "eve"]);

    affected(&admin, &format!("UPDATE bookings SET status = 'cancelled' WHERE id = {}", 2)).await;
    let days = rows(&dave, "SELECT * FROM bookable_days").await;
    assert_eq!(days.len(), 1);
    assert_eq!(days[0].get("date"), Some("2025-09-22"));
}

#[tokio::test]
async fn extended_protocol_with_parameters() {
    let (addr, _engine) = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let frank = connect(addr, "frank").await;

    let sid = create_slot(&admin, "2025-09-24", "14:00", "15:00", 3).await;

    let inserted = frank
        .query(
            "INSERT INTO bookings (slot_id, address) VALUES ($1, $2) RETURNING *",
            &[&sid.to_string(), &"1 Main St"],
        )
        .await
        .unwrap();
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted[0].get::<_, i64>("slot_id"), sid);
    assert_eq!(inserted[0].get::<_, Option<String>>("address").as_deref(), Some("1 Main St"));

    let slots = frank
        .query("SELECT * FROM bookable_slots WHERE date = $1", &[&"2025-09-24"])
        .await
        .unwrap();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].get::<_, i64>("id"), sid);
    assert_eq!(slots[0].get::<_, i32>("booked_count"), 1);
    assert_eq!(slots[0].get::<_, i32>("remaining"), 2);
}

#[tokio::test]
async fn bound_text_with_placeholder_syntax_is_stored_verbatim() {
    let (addr, _engine) = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let grace = connect(addr, "grace").await;

    let sid = create_slot(&admin, "2025-09-25", "10:00", "11:00", 2).await;

    let inserted = grace
        .query(
            "INSERT INTO bookings (slot_id, note) VALUES ($1, $2) RETURNING *",
            &[&sid.to_string(), &"pay $1 on arrival"],
        )
        .await
        .unwrap();
    assert_eq!(inserted.len(), 1);
    assert_eq!(
        inserted[0].get::<_, Option<String>>("note").as_deref(),
        Some("pay $1 on arrival")
    );
    assert_eq!(inserted[0].get::<_, String>("user_id"), "grace");
}
