use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};

use roombook::engine::{Engine, MemStore};
use roombook::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let engine = Arc::new(Engine::new(MemStore::ephemeral(), Duration::from_millis(500)));

    let engine2 = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(
                    socket,
                    engine,
                    "roombook".to_string(),
                    "roombook".to_string(),
                    None,
                )
                .await;
            });
        }
    });

    (addr, engine)
}

fn client_config(addr: SocketAddr, user: &str, password: &str) -> Config {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("roombook")
        .user(user)
        .password(password);
    config
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, connection) = client_config(addr, "roombook", "roombook")
        .connect(NoTls)
        .await
        .unwrap();
    tokio::spawn(connection);
    client
}

fn rows(msgs: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    msgs.into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn query(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    rows(client.simple_query(sql).await.unwrap())
}

async fn expect_code(client: &Client, sql: &str, code: &SqlState) {
    let err = client.simple_query(sql).await.err().unwrap();
    assert_eq!(err.code(), Some(code), "{sql}: {err:?}");
}

async fn create_room(client: &Client, room_no: &str) -> String {
    let rows = query(
        client,
        &format!("INSERT INTO rooms (room_no, capacity) VALUES ('{room_no}', 2)"),
    )
    .await;
    rows[0].get("id").unwrap().to_string()
}

fn book_sql(room_id: &str, guest: &str, start: &str, end: &str) -> String {
    format!(
        "INSERT INTO bookings (room_id, guest_id, starts_at, ends_at) \
         VALUES ('{room_id}', '{guest}', '{start}', '{end}')"
    )
}

const NINE: &str = "2025-01-01T09:00:00Z";
const TEN: &str = "2025-01-01T10:00:00Z";
const ELEVEN: &str = "2025-01-01T11:00:00Z";

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn insert_returns_created_rows() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let rows = query(&client, "INSERT INTO rooms (room_no, capacity) VALUES ('101', 3)").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("room_no"), Some("101"));
    assert_eq!(rows[0].get("capacity"), Some("3"));
    let room_id = rows[0].get("id").unwrap().to_string();

    let rows = query(&client, &book_sql(&room_id, "guest-1", NINE, TEN)).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("room_id"), Some(room_id.as_str()));
    assert_eq!(rows[0].get("status"), Some("PENDING"));
    assert_eq!(rows[0].get("starts_at"), Some(NINE));
}

#[tokio::test]
async fn overlapping_booking_is_exclusion_violation() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let room_id = create_room(&client, "101").await;

    query(&client, &book_sql(&room_id, "a", NINE, ELEVEN)).await;
    expect_code(
        &client,
        &book_sql(&room_id, "b", TEN, ELEVEN),
        &SqlState::EXCLUSION_VIOLATION,
    )
    .await;

    // Touching intervals are fine.
    query(&client, &book_sql(&room_id, "c", ELEVEN, "2025-01-01T12:00:00Z")).await;

    let all = query(&client, &format!("SELECT * FROM bookings WHERE room_id = '{room_id}'")).await;
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn error_codes_by_category() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let room_id = create_room(&client, "101").await;

    expect_code(&client, "INSERT INTO rooms (room_no, capacity) VALUES ('101', 1)", &SqlState::UNIQUE_VIOLATION).await;
    expect_code(&client, &book_sql(&room_id, "a", TEN, NINE), &SqlState::INVALID_PARAMETER_VALUE).await;
    expect_code(
        &client,
        &book_sql("01ARZ3NDEKTSV4RRFFQ69G5FAV", "a", NINE, TEN),
        &SqlState::NO_DATA_FOUND,
    )
    .await;
    expect_code(&client, "SELECT * FROM guests", &SqlState::UNDEFINED_TABLE).await;
    expect_code(&client, "SELEKT 1", &SqlState::SYNTAX_ERROR).await;
}

#[tokio::test]
async fn cancel_frees_the_slot() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let room_id = create_room(&client, "101").await;

    let rows = query(&client, &book_sql(&room_id, "a", NINE, TEN)).await;
    let booking_id = rows[0].get("id").unwrap().to_string();

    let rows = query(
        &client,
        &format!("UPDATE bookings SET status = 'cancelled' WHERE id = '{booking_id}'"),
    )
    .await;
    assert_eq!(rows[0].get("status"), Some("CANCELLED"));

    query(&client, &book_sql(&room_id, "b", NINE, TEN)).await;
}

#[tokio::test]
async fn conflict_probe_reports_blocking_booking() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let room_id = create_room(&client, "101").await;

    let rows = query(&client, &book_sql(&room_id, "a", NINE, TEN)).await;
    let booking_id = rows[0].get("id").unwrap().to_string();

    let probe = |start: &str, end: &str, exclude: Option<&str>| {
        let mut sql = format!(
            "SELECT * FROM conflicts WHERE room_id = '{room_id}' \
             AND starts_at = '{start}' AND ends_at = '{end}'"
        );
        if let Some(id) = exclude {
            sql.push_str(&format!(" AND exclude_id = '{id}'"));
        }
        sql
    };

    let hit = query(&client, &probe(NINE, ELEVEN, None)).await;
    assert_eq!(hit[0].get("conflict"), Some("t"));
    assert_eq!(hit[0].get("conflicting_id"), Some(booking_id.as_str()));

    let own = query(&client, &probe(NINE, ELEVEN, Some(&booking_id))).await;
    assert_eq!(own[0].get("conflict"), Some("f"));
    assert_eq!(own[0].get("conflicting_id"), None);

    let after = query(&client, &probe(TEN, ELEVEN, None)).await;
    assert_eq!(after[0].get("conflict"), Some("f"));
}

#[tokio::test]
async fn delete_and_select_by_id() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let room_id = create_room(&client, "101").await;
    let rows = query(&client, &book_sql(&room_id, "a", NINE, TEN)).await;
    let booking_id = rows[0].get("id").unwrap().to_string();

    let deleted = client
        .execute("DELETE FROM bookings WHERE id = $1", &[&booking_id])
        .await
        .unwrap();
    assert_eq!(deleted, 1);

    let gone = query(&client, &format!("SELECT * FROM bookings WHERE id = '{booking_id}'")).await;
    assert!(gone.is_empty());
    expect_code(
        &client,
        &format!("DELETE FROM bookings WHERE id = '{booking_id}'"),
        &SqlState::NO_DATA_FOUND,
    )
    .await;
}

#[tokio::test]
async fn bound_values_are_stored_verbatim() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let room_id = create_room(&client, "101").await;

    client
        .execute(
            "INSERT INTO bookings (room_id, guest_id, starts_at, ends_at) VALUES ($1, $2, $3, $4)",
            &[&room_id, &"guest$1", &NINE, &TEN],
        )
        .await
        .unwrap();
    client
        .execute(
            "INSERT INTO bookings (room_id, guest_id, starts_at, ends_at) VALUES ($1, $2, $3, $4)",
            &[&room_id, &"o'brien $4", &TEN, &ELEVEN],
        )
        .await
        .unwrap();

    let rows = query(
        &client,
        &format!("SELECT * FROM bookings WHERE room_id = '{room_id}'"),
    )
    .await;
    let guests: Vec<&str> = rows.iter().map(|r| r.get("guest_id").unwrap()).collect();
    assert_eq!(guests, vec!["guest$1", "o'brien $4"]);
    assert_eq!(rows[1].get("starts_at"), Some(TEN));
}

#[tokio::test]
async fn room_delete_cascades_over_the_wire() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    let room_id = create_room(&client, "101").await;
    query(&client, &book_sql(&room_id, "a", NINE, TEN)).await;

    client
        .simple_query(&format!("DELETE FROM rooms WHERE id = '{room_id}'"))
        .await
        .unwrap();

    assert!(query(&client, "SELECT * FROM rooms").await.is_empty());
    assert!(query(&client, "SELECT * FROM bookings").await.is_empty());
    assert_eq!(engine.store().room_count(), 0);
}

#[tokio::test]
async fn concurrent_clients_get_one_winner() {
    let (addr, _engine) = start_test_server().await;
    let setup = connect(addr).await;
    let room_id = create_room(&setup, "101").await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let sql = book_sql(&room_id, &format!("guest-{i}"), NINE, TEN);
        handles.push(tokio::spawn(async move {
            let client = connect(addr).await;
            client.simple_query(&sql).await
        }));
    }

    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert_eq!(e.code(), Some(&SqlState::EXCLUSION_VIOLATION)),
        }
    }
    assert_eq!(ok, 1);
}

#[tokio::test]
async fn wrong_user_is_refused() {
    let (addr, _engine) = start_test_server().await;
    let result = client_config(addr, "mallory", "roombook").connect(NoTls).await;
    assert!(result.is_err());

    let result = client_config(addr, "roombook", "wrong").connect(NoTls).await;
    assert!(result.is_err());
}
