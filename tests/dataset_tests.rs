//! Dataset adapters run against scripted sources into DuckDB

#![cfg(feature = "duckdb-backend")]

mod common;

use chrono::NaiveDate;
use cmdc_ingest::database::{DatabaseBackend, DuckDBBackend, WarehouseNames};
use cmdc_ingest::datasets::{
    CovidTrackingProject, DatasetAdapter, DatasetError, Delaware, JhuDailyReportsUs, NyTimesState,
    Wisconsin,
};
use cmdc_ingest::IngestConfig;
use cmdc_ingest::source::{ArcGisConfig, FetchError};
use common::MockTransport;
use serde_json::json;

async fn warehouse() -> DuckDBBackend {
    let backend = DuckDBBackend::in_memory().unwrap();
    backend.initialize(&WarehouseNames::default()).await.unwrap();
    backend
}

async fn count(backend: &DuckDBBackend, sql: &str) -> i64 {
    let result = backend.execute_query(sql).await.unwrap();
    result.scalar().and_then(|v| v.as_i64()).unwrap()
}

#[tokio::test]
async fn test_ctp_rerun_updates_values() {
    let backend = warehouse().await;
    let names = WarehouseNames::default();
    let url = "http://ctp.test/states/daily.json";
    let adapter = DatasetAdapter::Latest(Box::new(CovidTrackingProject::with_url(url)));

    let first = MockTransport::new().respond_json(
        url,
        json!([{"date": 20200706, "fips": "25", "death": 8183, "positive": 109974}]),
    );
    let result = adapter.run(&first, &backend, &names, None).await.unwrap();
    assert_eq!(result.rows_fetched, 2);
    assert!(result.skipped.is_none());

    let second = MockTransport::new().respond_json(
        url,
        json!([{"date": 20200706, "fips": "25", "death": 8200, "positive": 109974}]),
    );
    adapter.run(&second, &backend, &names, None).await.unwrap();

    assert_eq!(count(&backend, "SELECT count(*) FROM data.ctp_covid").await, 2);
    assert_eq!(
        count(
            &backend,
            "SELECT CAST(value AS BIGINT) FROM data.ctp_covid WHERE variable_id = 3"
        )
        .await,
        8200
    );
}

#[tokio::test]
async fn test_nytimes_zero_fill_is_persisted() {
    let backend = warehouse().await;
    let url = "http://nyt.test/us-states.csv";
    let http = MockTransport::new().respond(
        url,
        "date,state,fips,cases,deaths\n\
         2020-03-01,Washington,53,10,1\n\
         2020-03-02,Washington,53,12,2\n\
         2020-03-02,Florida,12,2,0\n",
    );
    let adapter = DatasetAdapter::Latest(Box::new(NyTimesState::with_url(url)));

    let result = adapter
        .run(&http, &backend, &WarehouseNames::default(), None)
        .await
        .unwrap();

    assert_eq!(result.rows_fetched, 8);
    assert_eq!(count(&backend, "SELECT count(*) FROM data.covid_nytimes").await, 8);
    assert_eq!(
        count(
            &backend,
            "SELECT count(*) FROM data.covid_nytimes WHERE fips = 12 AND dt = DATE '2020-03-01' AND value = 0"
        )
        .await,
        2
    );
}

#[tokio::test]
async fn test_jhu_skips_dates_before_first_report() {
    let backend = warehouse().await;
    let http = MockTransport::new();
    let adapter =
        DatasetAdapter::Dated(Box::new(JhuDailyReportsUs::with_base_url("http://jhu.test")));

    let result = adapter
        .run(
            &http,
            &backend,
            &WarehouseNames::default(),
            NaiveDate::from_ymd_opt(2020, 3, 1),
        )
        .await
        .unwrap();

    assert!(result.skipped.is_some());
    assert_eq!(result.rows_written, 0);
    assert_eq!(http.calls(), 0);
}

#[tokio::test]
async fn test_jhu_fetches_requested_date() {
    let backend = warehouse().await;
    let http = MockTransport::new().respond(
        "http://jhu.test/csse_covid_19_data/csse_covid_19_daily_reports_us/07-06-2020.csv",
        "Province_State,Country_Region,Last_Update,FIPS,Confirmed,Deaths,Recovered,Active\n\
         Alabama,US,2020-07-07 04:34:13,1.0,44878,1007,22082,21789\n",
    );
    let adapter =
        DatasetAdapter::Dated(Box::new(JhuDailyReportsUs::with_base_url("http://jhu.test")));
    assert!(adapter.needs_date());

    adapter
        .run(
            &http,
            &backend,
            &WarehouseNames::default(),
            NaiveDate::from_ymd_opt(2020, 7, 6),
        )
        .await
        .unwrap();

    assert_eq!(
        count(
            &backend,
            "SELECT count(*) FROM data.jhu_daily_reports_us WHERE vintage = DATE '2020-07-07' AND dt = DATE '2020-07-06'"
        )
        .await,
        4
    );
}

#[tokio::test]
async fn test_wisconsin_pages_into_us_covid() {
    let backend = warehouse().await;
    let url = "http://wi.test/rest/services/COVID19_WI/FeatureServer/10/query";
    let http = MockTransport::new()
        .respond_json(
            url,
            json!({
                "features": [{"attributes": {"DATE": 1_588_291_200_000i64, "GEOID": "55", "POSITIVE": 7000, "NEGATIVE": 63000, "DEATHS": 300}}],
                "exceededTransferLimit": true
            }),
        )
        .respond_json(
            url,
            json!({
                "features": [{"attributes": {"DATE": 1_588_291_200_000i64, "GEOID": "55025", "POSITIVE": 500, "NEGATIVE": null, "DEATHS": 20}}]
            }),
        );
    let adapter = DatasetAdapter::Latest(Box::new(Wisconsin::with_config(
        ArcGisConfig::new("org", Some(1)).with_base_url("http://wi.test/rest/services"),
    )));

    let result = adapter
        .run(&http, &backend, &WarehouseNames::default(), None)
        .await
        .unwrap();

    assert_eq!(result.rows_fetched, 8);
    assert_eq!(http.calls(), 2);
    assert_eq!(
        count(&backend, "SELECT count(*) FROM data.us_covid WHERE provider = 'state'").await,
        8
    );
    assert_eq!(
        count(
            &backend,
            "SELECT CAST(value AS BIGINT) FROM data.us_covid WHERE fips = 55 AND variable_id = 10"
        )
        .await,
        70000
    );
}

#[tokio::test]
async fn test_delaware_counties_resolve_to_fips() {
    let backend = warehouse().await;
    backend
        .execute_batch(
            "INSERT INTO meta.us_fips (fips, name, state) VALUES \
             (10001, 'Kent', '10'), (10005, 'Sussex', '10'), (24029, 'Kent', '24');",
        )
        .await
        .unwrap();

    let csv = |county: &str, deaths: u32| {
        format!(
            "Location,Statistic,Value,Unit,Year,Month,Day\n\
             {c} County,Deaths,{d},people,2020,5,1\n\
             {c} County,Deaths,1.5,rate per 10k people,2020,5,1\n",
            c = county,
            d = deaths
        )
    };
    let http = MockTransport::new()
        .respond("http://de.test/kent", csv("Kent", 12))
        .respond("http://de.test/sussex", csv("Sussex", 30));
    let adapter = DatasetAdapter::Latest(Box::new(Delaware::with_sources(vec![
        ("Kent".to_string(), "http://de.test/kent".to_string()),
        ("Sussex".to_string(), "http://de.test/sussex".to_string()),
    ])));

    adapter
        .run(&http, &backend, &WarehouseNames::default(), None)
        .await
        .unwrap();

    let result = backend
        .execute_query("SELECT fips, value FROM data.us_covid ORDER BY fips")
        .await
        .unwrap();
    let rows: Vec<(i64, f64)> = result
        .rows
        .iter()
        .map(|r| (r["fips"].as_i64().unwrap(), r["value"].as_f64().unwrap()))
        .collect();
    assert_eq!(rows, vec![(10001, 12.0), (10005, 30.0)]);
}

#[tokio::test]
async fn test_source_failure_writes_nothing() {
    let backend = warehouse().await;
    let http = MockTransport::new();
    let adapter =
        DatasetAdapter::Latest(Box::new(NyTimesState::with_url("http://nyt.test/missing.csv")));

    let err = adapter
        .run(&http, &backend, &WarehouseNames::default(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, DatasetError::Fetch(FetchError::Status { status: 404, .. })));
    assert_eq!(count(&backend, "SELECT count(*) FROM data.covid_nytimes").await, 0);
}

#[tokio::test]
async fn test_wisconsin_uses_configured_retry_bound() {
    let config = IngestConfig::parse("[arcgis]\nmax_empty_page_retries = 1\n").unwrap();
    let url = "https://services1.arcgis.com/ISZ89Z51ft1G16OK/ArcGIS/rest/services\
               /COVID19_WI/FeatureServer/10/query";
    let http = MockTransport::new()
        .respond_json(url, json!({"features": [], "exceededTransferLimit": true}));
    let adapter = DatasetAdapter::Latest(Box::new(Wisconsin::from_config(&config)));

    let err = adapter.fetch(&http, None).await.unwrap_err();

    assert!(matches!(
        err,
        DatasetError::Fetch(FetchError::IncompletePagination { attempts: 2, .. })
    ));
    assert_eq!(http.calls(), 2);
}
