//! Upsert engine against an in-memory DuckDB warehouse

#![cfg(feature = "duckdb-backend")]

use chrono::NaiveDate;
use cmdc_ingest::database::{
    ConflictPolicy, DatabaseBackend, DatabaseError, DuckDBBackend, InsertShape, PersistTarget,
    UpsertEngine, WarehouseNames,
};
use cmdc_ingest::models::{CanonicalRow, Location, Record};
use serde_json::json;

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 7, day).unwrap()
}

async fn warehouse() -> DuckDBBackend {
    let backend = DuckDBBackend::in_memory().unwrap();
    backend.initialize(&WarehouseNames::default()).await.unwrap();
    backend
}

async fn count(backend: &DuckDBBackend, sql: &str) -> i64 {
    let result = backend.execute_query(sql).await.unwrap();
    result.scalar().and_then(|v| v.as_i64()).unwrap()
}

async fn values(backend: &DuckDBBackend, table: &str) -> Vec<f64> {
    let result = backend
        .execute_query(&format!("SELECT value FROM data.{} ORDER BY fips, variable_id", table))
        .await
        .unwrap();
    result
        .rows
        .iter()
        .map(|r| r["value"].as_f64().unwrap())
        .collect()
}

fn ctp_target(policy: ConflictPolicy) -> PersistTarget {
    PersistTarget::new("ctp_covid", &["vintage", "dt", "fips", "variable_id"])
        .with_policy(policy)
        .with_shape(InsertShape::VariableLookup { provider: None })
}

fn rows(value: f64) -> Vec<CanonicalRow> {
    vec![
        CanonicalRow::new(date(7), date(6), Location::Fips(25), "cases_total", value),
        CanonicalRow::new(date(7), date(6), Location::Fips(25), "deaths_total", value / 10.0),
    ]
}

#[tokio::test]
async fn test_do_nothing_is_idempotent() {
    let backend = warehouse().await;
    let engine = UpsertEngine::new(&backend, WarehouseNames::default());
    let target = ctp_target(ConflictPolicy::DoNothing);

    engine.persist(&rows(100.0), &target).await.unwrap();
    engine.persist(&rows(100.0), &target).await.unwrap();

    assert_eq!(count(&backend, "SELECT count(*) FROM data.ctp_covid").await, 2);
}

#[tokio::test]
async fn test_do_nothing_keeps_first_value() {
    let backend = warehouse().await;
    let engine = UpsertEngine::new(&backend, WarehouseNames::default());
    let target = ctp_target(ConflictPolicy::DoNothing);

    engine.persist(&rows(100.0), &target).await.unwrap();
    engine.persist(&rows(500.0), &target).await.unwrap();

    assert_eq!(values(&backend, "ctp_covid").await, vec![100.0, 10.0]);
}

#[tokio::test]
async fn test_do_update_overwrites_value() {
    let backend = warehouse().await;
    let engine = UpsertEngine::new(&backend, WarehouseNames::default());
    let target = ctp_target(ConflictPolicy::DoUpdate);

    engine.persist(&rows(100.0), &target).await.unwrap();
    engine.persist(&rows(500.0), &target).await.unwrap();

    assert_eq!(count(&backend, "SELECT count(*) FROM data.ctp_covid").await, 2);
    assert_eq!(values(&backend, "ctp_covid").await, vec![500.0, 50.0]);
}

#[tokio::test]
async fn test_unknown_variables_are_dropped() {
    let backend = warehouse().await;
    let engine = UpsertEngine::new(&backend, WarehouseNames::default());
    let mut batch = rows(100.0);
    batch.push(CanonicalRow::new(date(7), date(6), Location::Fips(25), "not_a_variable", 1.0));

    engine
        .persist(&batch, &ctp_target(ConflictPolicy::DoNothing))
        .await
        .unwrap();

    assert_eq!(count(&backend, "SELECT count(*) FROM data.ctp_covid").await, 2);
}

#[tokio::test]
async fn test_provider_is_written() {
    let backend = warehouse().await;
    let engine = UpsertEngine::new(&backend, WarehouseNames::default());
    let target = PersistTarget::new("us_covid", &["vintage", "dt", "fips", "variable_id"])
        .with_policy(ConflictPolicy::DoUpdate)
        .with_shape(InsertShape::VariableLookup {
            provider: Some("state".to_string()),
        });

    engine.persist(&rows(100.0), &target).await.unwrap();

    assert_eq!(
        count(&backend, "SELECT count(*) FROM data.us_covid WHERE provider = 'state'").await,
        2
    );
}

#[tokio::test]
async fn test_county_names_resolve_within_state() {
    let backend = warehouse().await;
    backend
        .execute_batch(
            "INSERT INTO meta.us_fips (fips, name, state) VALUES \
             (10001, 'Kent', '10'), (24029, 'Kent', '24'), (10005, 'Sussex', '10');",
        )
        .await
        .unwrap();

    let engine = UpsertEngine::new(&backend, WarehouseNames::default());
    let target = PersistTarget::new("us_covid", &["vintage", "dt", "fips", "variable_id"])
        .with_policy(ConflictPolicy::DoUpdate)
        .with_shape(InsertShape::CountyLookup {
            state_fips: 10,
            provider: Some("state".to_string()),
        });
    let county = |name: &str, value: f64| {
        CanonicalRow::new(
            date(7),
            date(6),
            Location::County(name.to_string()),
            "cases_total",
            value,
        )
    };
    let rows = vec![county("Kent", 12.0), county("Sussex", 30.0), county("Nowhere", 1.0)];

    engine.persist(&rows, &target).await.unwrap();

    let result = backend
        .execute_query("SELECT fips FROM data.us_covid ORDER BY fips")
        .await
        .unwrap();
    let fips: Vec<i64> = result.rows.iter().map(|r| r["fips"].as_i64().unwrap()).collect();
    assert_eq!(fips, vec![10001, 10005]);
}

#[tokio::test]
async fn test_higher_priority_wins() {
    let backend = warehouse().await;
    backend
        .execute_batch(
            "CREATE TABLE data.ranked (fips INTEGER, dt DATE, value DOUBLE PRECISION, priority INTEGER, \
             PRIMARY KEY (fips, dt));",
        )
        .await
        .unwrap();

    let engine = UpsertEngine::new(&backend, WarehouseNames::default());
    let target = PersistTarget::new("ranked", &["fips", "dt"]).with_policy(
        ConflictPolicy::PreferHigherPriority {
            column: "priority".to_string(),
        },
    );
    let record = |value: f64, priority: i64| -> Record {
        json!({"fips": 24, "dt": "2020-07-06", "value": value, "priority": priority})
            .as_object()
            .cloned()
            .unwrap()
    };

    engine.persist(&[record(1.0, 2)], &target).await.unwrap();
    engine.persist(&[record(2.0, 1)], &target).await.unwrap();
    let after_lower = backend
        .execute_query("SELECT value, priority FROM data.ranked")
        .await
        .unwrap();
    assert_eq!(after_lower.rows[0]["value"], json!(1.0));

    engine.persist(&[record(3.0, 5)], &target).await.unwrap();
    let after_higher = backend
        .execute_query("SELECT value, priority FROM data.ranked")
        .await
        .unwrap();
    assert_eq!(after_higher.rows[0]["value"], json!(3.0));
    assert_eq!(after_higher.rows[0]["priority"], json!(5));
}

#[tokio::test]
async fn test_missing_target_table_reports_schema_error() {
    let backend = warehouse().await;
    let engine = UpsertEngine::new(&backend, WarehouseNames::default());
    let target = PersistTarget::new("nonexistent", &["vintage", "dt", "fips", "variable_id"])
        .with_shape(InsertShape::VariableLookup { provider: None });

    let err = engine.persist(&rows(1.0), &target).await.unwrap_err();

    assert!(matches!(err, DatabaseError::SchemaError { .. }), "{err}");
}

#[tokio::test]
async fn test_empty_batch_writes_nothing() {
    let backend = warehouse().await;
    let engine = UpsertEngine::new(&backend, WarehouseNames::default());
    let written = engine
        .persist::<CanonicalRow>(&[], &ctp_target(ConflictPolicy::DoNothing))
        .await
        .unwrap();
    assert_eq!(written, 0);
}

#[tokio::test]
async fn test_custom_schema_names() {
    let backend = DuckDBBackend::in_memory().unwrap();
    let names = WarehouseNames {
        data_schema: "covid".to_string(),
        meta_schema: "lookup".to_string(),
    };
    backend.initialize(&names).await.unwrap();

    let engine = UpsertEngine::new(&backend, names);
    engine
        .persist(&rows(7.0), &ctp_target(ConflictPolicy::DoNothing))
        .await
        .unwrap();

    assert_eq!(count(&backend, "SELECT count(*) FROM covid.ctp_covid").await, 2);
}
