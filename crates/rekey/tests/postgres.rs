//! End-to-end runs against a real PostgreSQL.
//!
//! Run with: cargo test -p rekey --features test-postgres --test postgres
//!
//! Note: Requires Docker to be running.

#![cfg(feature = "test-postgres")]

use rekey::solver::OrderError;
use rekey::{Error, RekeyConfig, Rekeyer, TablePhase};
use std::collections::HashMap;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio_postgres::{Client, NoTls};

/// Start a throwaway PostgreSQL and connect to it.
async fn setup_postgres() -> (ContainerAsync<Postgres>, Client) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let container = Postgres::default()
        .start()
        .await
        .expect("failed to start postgres container");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("postgres port not available");

    let conn_str = format!(
        "host=127.0.0.1 port={} user=postgres password=postgres dbname=postgres",
        port
    );

    // The port can be open before postgres accepts connections.
    let mut attempts = 0;
    let (client, connection) = loop {
        attempts += 1;
        match tokio_postgres::connect(&conn_str, NoTls).await {
            Ok(result) => break result,
            Err(e) if attempts < 10 => {
                tracing::debug!("connection attempt {} failed: {}, retrying...", attempts, e);
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Err(e) => panic!("failed to connect to postgres after {} attempts: {}", attempts, e),
        }
    };

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("connection error: {}", e);
        }
    });

    (container, client)
}

async fn count(client: &Client, table: &str) -> i64 {
    client
        .query_one(&format!("SELECT count(*) FROM \"{}\"", table), &[])
        .await
        .unwrap()
        .get(0)
}

async fn column_type(client: &Client, table: &str, column: &str) -> String {
    client
        .query_one(
            "SELECT format_type(atttypid, atttypmod) FROM pg_attribute \
             WHERE attrelid = $1::text::regclass AND attname = $2",
            &[&format!("public.\"{}\"", table), &column],
        )
        .await
        .unwrap()
        .get(0)
}

async fn table_exists(client: &Client, table: &str) -> bool {
    client
        .query_one(
            "SELECT to_regclass($1) IS NOT NULL",
            &[&format!("public.\"{}\"", table)],
        )
        .await
        .unwrap()
        .get(0)
}

async fn constraint_exists(client: &Client, name: &str) -> bool {
    client
        .query_one(
            "SELECT EXISTS (SELECT 1 FROM pg_constraint WHERE conname = $1)",
            &[&name],
        )
        .await
        .unwrap()
        .get(0)
}

async fn create_team_user(client: &Client) {
    client
        .batch_execute(
            r#"
            CREATE TABLE team (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE "user" (
                id BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY,
                name TEXT NOT NULL,
                team_id BIGINT NOT NULL REFERENCES team(id) ON DELETE CASCADE,
                stripe_customer_id BIGINT
            );
            CREATE UNIQUE INDEX user_name_idx ON "user" (name);

            INSERT INTO team (id, name) VALUES (1, 'red'), (2, 'blue');
            INSERT INTO "user" (id, name, team_id, stripe_customer_id) VALUES
                (1, 'a', 1, 9001),
                (2, 'b', 2, NULL),
                (3, 'c', 1, 9003);
            "#,
        )
        .await
        .expect("failed to create tables");
}

#[tokio::test]
async fn test_team_user_scenario() {
    let (_container, client) = setup_postgres().await;
    create_team_user(&client).await;
    client
        .batch_execute(
            "CREATE TABLE audit_log (id BIGSERIAL PRIMARY KEY, note TEXT);
             INSERT INTO audit_log (note) VALUES ('boot');",
        )
        .await
        .unwrap();

    let config = RekeyConfig {
        excluded: vec!["audit_log".to_string()],
        ..RekeyConfig::default()
    };
    let report = Rekeyer::new(&client, config).run().await.unwrap();

    assert_eq!(report.order.tables, vec!["team", "user"]);
    assert_eq!(report.rows(), 5);
    assert_eq!(report.cutover.promoted, vec!["user", "team"]);

    assert_eq!(count(&client, "team").await, 2);
    assert_eq!(count(&client, "user").await, 3);
    assert!(!table_exists(&client, "team_ulid").await);
    assert!(!table_exists(&client, "user_ulid").await);

    assert_eq!(column_type(&client, "team", "id").await, "character(26)");
    assert_eq!(column_type(&client, "user", "id").await, "character(26)");
    assert_eq!(column_type(&client, "user", "team_id").await, "character(26)");
    // no declared key: left alone
    assert_eq!(column_type(&client, "user", "stripe_customer_id").await, "bigint");
    assert_eq!(column_type(&client, "audit_log", "id").await, "bigint");

    // every user still points at the team it pointed at before
    let rows = client
        .query(
            r#"SELECT u.name, t.name, u.team_id::text, u.stripe_customer_id
               FROM "user" u JOIN team t ON t.id = u.team_id
               ORDER BY u.name"#,
            &[],
        )
        .await
        .unwrap();
    let pairs: Vec<(String, String, Option<i64>)> =
        rows.iter().map(|r| (r.get(0), r.get(1), r.get(3))).collect();
    assert_eq!(
        pairs,
        vec![
            ("a".to_string(), "red".to_string(), Some(9001)),
            ("b".to_string(), "blue".to_string(), None),
            ("c".to_string(), "red".to_string(), Some(9003)),
        ]
    );
    for row in &rows {
        let team_id: String = row.get(2);
        assert_eq!(team_id.len(), 26);
        assert!(team_id != "1" && team_id != "2");
    }

    // constraints and indexes back under their original names
    assert!(constraint_exists(&client, "team_pkey").await);
    assert!(constraint_exists(&client, "user_pkey").await);
    assert!(constraint_exists(&client, "user_team_id_fkey").await);
    let index: i64 = client
        .query_one(
            "SELECT count(*) FROM pg_indexes WHERE indexname = 'user_name_idx'",
            &[],
        )
        .await
        .unwrap()
        .get(0);
    assert_eq!(index, 1);

    // recreated key still enforces and cascades
    let orphan = client
        .execute(
            r#"INSERT INTO "user" (id, name, team_id) VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', 'z', '01ARZ3NDEKTSV4RRFFQ69G5FAW')"#,
            &[],
        )
        .await;
    assert!(orphan.is_err());
    client
        .execute("DELETE FROM team WHERE name = 'red'", &[])
        .await
        .unwrap();
    assert_eq!(count(&client, "user").await, 1);

    let state = rekey::state::load(&client, "public").await.unwrap();
    let phases: HashMap<String, TablePhase> =
        state.into_iter().map(|e| (e.table, e.phase)).collect();
    assert_eq!(phases.get("team"), Some(&TablePhase::Cutover));
    assert_eq!(phases.get("user"), Some(&TablePhase::Cutover));
    assert!(!phases.contains_key("audit_log"));
}

#[tokio::test]
async fn test_ids_follow_source_order() {
    let (_container, client) = setup_postgres().await;
    create_team_user(&client).await;

    Rekeyer::new(&client, RekeyConfig::default())
        .run()
        .await
        .unwrap();

    let names: Vec<String> = client
        .query(r#"SELECT name FROM "user" ORDER BY id"#, &[])
        .await
        .unwrap()
        .iter()
        .map(|r| r.get(0))
        .collect();
    assert_eq!(names, vec!["a", "b", "c"]);

    let distinct: i64 = client
        .query_one(
            r#"SELECT count(DISTINCT id) FROM (SELECT id FROM team UNION ALL SELECT id FROM "user") ids"#,
            &[],
        )
        .await
        .unwrap()
        .get(0);
    assert_eq!(distinct, 5);
}

#[tokio::test]
async fn test_zero_row_tables() {
    let (_container, client) = setup_postgres().await;
    client
        .batch_execute(
            r#"
            CREATE TABLE archive (id SERIAL PRIMARY KEY, label TEXT NOT NULL DEFAULT 'untitled');
            CREATE TABLE archive_entry (
                id SERIAL PRIMARY KEY,
                archive_id INTEGER REFERENCES archive(id),
                body TEXT
            );
            "#,
        )
        .await
        .unwrap();

    let report = Rekeyer::new(&client, RekeyConfig::default())
        .run()
        .await
        .unwrap();
    assert_eq!(report.rows(), 0);

    assert_eq!(count(&client, "archive").await, 0);
    assert_eq!(count(&client, "archive_entry").await, 0);
    assert_eq!(column_type(&client, "archive", "id").await, "character(26)");
    assert_eq!(
        column_type(&client, "archive_entry", "archive_id").await,
        "character(26)"
    );
    assert!(constraint_exists(&client, "archive_entry_archive_id_fkey").await);

    // plain defaults survive
    client
        .execute(
            "INSERT INTO archive (id) VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV')",
            &[],
        )
        .await
        .unwrap();
    let label: String = client
        .query_one("SELECT label FROM archive", &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(label, "untitled");
}

#[tokio::test]
async fn test_stale_shadow_is_rebuilt() {
    let (_container, client) = setup_postgres().await;
    create_team_user(&client).await;

    // left behind by a run that died mid-copy
    client
        .batch_execute(
            "CREATE TABLE team_ulid (id CHAR(26) PRIMARY KEY, name TEXT NOT NULL);
             INSERT INTO team_ulid VALUES
                 ('01ARZ3NDEKTSV4RRFFQ69G5FA1', 'x'),
                 ('01ARZ3NDEKTSV4RRFFQ69G5FA2', 'y'),
                 ('01ARZ3NDEKTSV4RRFFQ69G5FA3', 'z');",
        )
        .await
        .unwrap();

    let report = Rekeyer::new(&client, RekeyConfig::default())
        .run()
        .await
        .unwrap();
    // the stale shadow is not a table of its own
    assert_eq!(report.order.tables, vec!["team", "user"]);
    assert_eq!(count(&client, "team").await, 2);
    assert_eq!(count(&client, "user").await, 3);

    let err = Rekeyer::new(&client, RekeyConfig::default())
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyMigrated { .. }), "{err}");
}

#[tokio::test]
async fn test_required_cycle_rejected_before_any_copy() {
    let (_container, client) = setup_postgres().await;
    client
        .batch_execute(
            "CREATE TABLE a (id BIGINT PRIMARY KEY, b_id BIGINT NOT NULL);
             CREATE TABLE b (id BIGINT PRIMARY KEY, a_id BIGINT NOT NULL REFERENCES a(id));
             ALTER TABLE a ADD FOREIGN KEY (b_id) REFERENCES b(id);",
        )
        .await
        .unwrap();

    let err = Rekeyer::new(&client, RekeyConfig::default())
        .run()
        .await
        .unwrap_err();
    match err {
        Error::Order(OrderError::CycleDetected { tables }) => {
            assert!(tables.contains(&"a".to_string()));
            assert!(tables.contains(&"b".to_string()));
        }
        other => panic!("expected a cycle error, got {other}"),
    }

    assert!(!table_exists(&client, "a_ulid").await);
    assert!(!table_exists(&client, "b_ulid").await);
    assert_eq!(column_type(&client, "a", "id").await, "bigint");
}

#[tokio::test]
async fn test_nullable_cycle_is_deferred() {
    let (_container, client) = setup_postgres().await;
    client
        .batch_execute(
            "CREATE TABLE department (id BIGINT PRIMARY KEY, name TEXT NOT NULL, head_id BIGINT);
             CREATE TABLE employee (
                 id BIGINT PRIMARY KEY,
                 name TEXT NOT NULL,
                 department_id BIGINT NOT NULL REFERENCES department(id)
             );
             ALTER TABLE department ADD CONSTRAINT department_head_id_fkey
                 FOREIGN KEY (head_id) REFERENCES employee(id) ON DELETE SET NULL;
             INSERT INTO department VALUES (1, 'eng', NULL), (2, 'ops', NULL);
             INSERT INTO employee VALUES (10, 'boss', 1), (11, 'dev', 1), (12, 'sre', 2);
             UPDATE department SET head_id = 10 WHERE id = 1;",
        )
        .await
        .unwrap();

    let report = Rekeyer::new(&client, RekeyConfig::default())
        .run()
        .await
        .unwrap();
    assert_eq!(report.order.tables, vec!["department", "employee"]);
    assert_eq!(report.order.deferred.len(), 1);
    assert_eq!(report.fixups, 1);

    let heads: Vec<(String, Option<String>)> = client
        .query(
            "SELECT d.name, e.name FROM department d LEFT JOIN employee e ON e.id = d.head_id ORDER BY d.name",
            &[],
        )
        .await
        .unwrap()
        .iter()
        .map(|r| (r.get(0), r.get(1)))
        .collect();
    assert_eq!(
        heads,
        vec![
            ("eng".to_string(), Some("boss".to_string())),
            ("ops".to_string(), None),
        ]
    );
    assert!(constraint_exists(&client, "department_head_id_fkey").await);
}

#[tokio::test]
async fn test_self_reference_children_before_parents() {
    let (_container, client) = setup_postgres().await;
    client
        .batch_execute(
            "CREATE TABLE category (
                 id BIGINT PRIMARY KEY,
                 name TEXT NOT NULL,
                 parent_id BIGINT REFERENCES category(id)
             );
             INSERT INTO category VALUES (1, 'leaf', 2), (2, 'branch', 3), (3, 'root', NULL);",
        )
        .await
        .unwrap();

    Rekeyer::new(&client, RekeyConfig::default())
        .run()
        .await
        .unwrap();

    let tree: Vec<(String, Option<String>)> = client
        .query(
            "SELECT c.name, p.name FROM category c LEFT JOIN category p ON p.id = c.parent_id ORDER BY c.name",
            &[],
        )
        .await
        .unwrap()
        .iter()
        .map(|r| (r.get(0), r.get(1)))
        .collect();
    assert_eq!(
        tree,
        vec![
            ("branch".to_string(), Some("root".to_string())),
            ("leaf".to_string(), Some("branch".to_string())),
            ("root".to_string(), None),
        ]
    );
}

#[tokio::test]
async fn test_column_values_survive_unchanged() {
    let (_container, client) = setup_postgres().await;
    client
        .batch_execute(
            r#"
            CREATE TYPE "Mood" AS ENUM ('happy', 'sad');
            CREATE TABLE item (
                id BIGSERIAL PRIMARY KEY,
                label TEXT NOT NULL,
                mood "Mood" DEFAULT 'happy',
                price NUMERIC(12, 2),
                meta JSONB,
                created_at TIMESTAMPTZ,
                raw BYTEA,
                tags TEXT[],
                label_length INTEGER GENERATED ALWAYS AS (length(label)) STORED
            );
            INSERT INTO item (label, mood, price, meta, created_at, raw, tags) VALUES
                ('plain', 'sad', 1234.50, '{"a": [1, 2]}', '2024-03-01 12:00:00+00', '\xdeadbeef', '{x,"y z"}'),
                ('it''s "quoted"', NULL, NULL, NULL, NULL, NULL, NULL),
                ('ünïcødé', 'happy', 0.01, '"s"', '1999-12-31 23:59:59.999+05', '\x', '{}');
            "#,
        )
        .await
        .unwrap();

    const SNAPSHOT: &str = "SELECT label, mood::text, price::text, meta::text, created_at::text, \
                            raw::text, tags::text, label_length::text FROM item ORDER BY id";
    let read = |rows: Vec<tokio_postgres::Row>| -> Vec<Vec<Option<String>>> {
        rows.iter()
            .map(|r| (0..8).map(|i| r.get::<_, Option<String>>(i)).collect())
            .collect()
    };
    let before = read(client.query(SNAPSHOT, &[]).await.unwrap());

    Rekeyer::new(&client, RekeyConfig::default())
        .run()
        .await
        .unwrap();

    let after = read(client.query(SNAPSHOT, &[]).await.unwrap());
    assert_eq!(before, after);
    assert_eq!(column_type(&client, "item", "mood").await, "\"Mood\"");
    assert_eq!(column_type(&client, "item", "price").await, "numeric(12,2)");
}

#[tokio::test]
async fn test_foreign_key_into_unique_column() {
    let (_container, client) = setup_postgres().await;
    // member sorts before team, so it is promoted after it
    client
        .batch_execute(
            r#"
            CREATE TABLE team (
                id BIGSERIAL PRIMARY KEY,
                code TEXT NOT NULL UNIQUE
            );
            CREATE TABLE member (
                id BIGSERIAL PRIMARY KEY,
                team_code TEXT NOT NULL REFERENCES team(code)
            );
            INSERT INTO team (code) VALUES ('red'), ('blue');
            INSERT INTO member (team_code) VALUES ('red'), ('blue'), ('red');
            "#,
        )
        .await
        .unwrap();

    Rekeyer::new(&client, RekeyConfig::default())
        .run()
        .await
        .unwrap();

    assert_eq!(count(&client, "member").await, 3);
    assert!(constraint_exists(&client, "member_team_code_fkey").await);
    assert_eq!(column_type(&client, "member", "team_code").await, "text");

    let err = client
        .batch_execute("INSERT INTO member (id, team_code) VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', 'green')")
        .await
        .unwrap_err();
    assert_eq!(
        err.code(),
        Some(&tokio_postgres::error::SqlState::FOREIGN_KEY_VIOLATION)
    );
}

#[tokio::test]
async fn test_check_constraints_survive_cutover() {
    let (_container, client) = setup_postgres().await;
    client
        .batch_execute(
            r#"
            CREATE TABLE item (
                id BIGSERIAL PRIMARY KEY CHECK (id > 0),
                qty INTEGER NOT NULL CONSTRAINT item_qty_check CHECK (qty > 0)
            );
            INSERT INTO item (qty) VALUES (1), (5);
            "#,
        )
        .await
        .unwrap();

    Rekeyer::new(&client, RekeyConfig::default())
        .run()
        .await
        .unwrap();

    let checks: Vec<String> = client
        .query(
            "SELECT conname::text FROM pg_constraint \
             WHERE conrelid = 'public.item'::regclass AND contype = 'c' ORDER BY conname",
            &[],
        )
        .await
        .unwrap()
        .iter()
        .map(|r| r.get(0))
        .collect();
    // the check on the re-keyed id cannot hold for text values
    assert_eq!(checks, vec!["item_qty_check"]);

    let err = client
        .batch_execute("INSERT INTO item (id, qty) VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', -1)")
        .await
        .unwrap_err();
    assert_eq!(
        err.code(),
        Some(&tokio_postgres::error::SqlState::CHECK_VIOLATION)
    );
}

#[tokio::test]
async fn test_foreign_key_options_survive_cutover() {
    let (_container, client) = setup_postgres().await;
    client
        .batch_execute(
            r#"
            CREATE TABLE team (id BIGSERIAL PRIMARY KEY);
            CREATE TABLE player (
                id BIGSERIAL PRIMARY KEY,
                team_id BIGINT,
                CONSTRAINT player_team_id_fkey FOREIGN KEY (team_id) REFERENCES team(id)
                    MATCH FULL ON DELETE SET NULL DEFERRABLE INITIALLY DEFERRED
            );
            INSERT INTO team DEFAULT VALUES;
            INSERT INTO player (team_id) VALUES (1), (NULL);
            "#,
        )
        .await
        .unwrap();

    Rekeyer::new(&client, RekeyConfig::default())
        .run()
        .await
        .unwrap();

    let row = client
        .query_one(
            "SELECT condeferrable, condeferred, confmatchtype::text, confdeltype::text \
             FROM pg_constraint WHERE conname = 'player_team_id_fkey'",
            &[],
        )
        .await
        .unwrap();
    let deferrable: bool = row.get(0);
    let deferred: bool = row.get(1);
    let match_type: String = row.get(2);
    let on_delete: String = row.get(3);
    assert!(deferrable);
    assert!(deferred);
    assert_eq!(match_type, "f");
    assert_eq!(on_delete, "n");
    assert_eq!(count(&client, "player").await, 2);
}
