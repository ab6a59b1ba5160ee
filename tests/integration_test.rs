//! End-to-end tests: HTTP ingestion through rotation to archives on disk.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration, Local, TimeZone};
use tempfile::tempdir;
use tokio::net::TcpListener;
use tower::ServiceExt;
use zip::ZipArchive;

use csp_collector::aggregator::{ManualClock, STALE_FLUSH_AFTER_DAYS};
use csp_collector::forwarder::{spawn_forwarder, Forwarder, ForwarderConfig, Transport};
use csp_collector::server::ingest_router;
use csp_collector::{AppContext, Config};

fn report(document_uri: &str, marker: &str) -> String {
    format!(
        r#"{{"csp-report":{{"document-uri":"{}","blocked-uri":"{}","violated-directive":"script-src"}}}}"#,
        document_uri, marker
    )
}

fn post(body: String) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/csp")
        .header("content-type", "application/csp-report")
        .body(Body::from(body))
        .unwrap()
}

fn archive_text(path: &Path, entry: &str) -> String {
    let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut text = String::new();
    archive.by_name(entry).unwrap().read_to_string(&mut text).unwrap();
    text
}

fn config(dir: &Path, max_reports: u64) -> Config {
    Config {
        domains: vec!["example.com".to_string(), "shop.example.org".to_string()],
        archive_dir: dir.to_path_buf(),
        max_reports_per_archive: max_reports,
        ..Config::default()
    }
}

#[tokio::test]
async fn test_threshold_rotation_scenario() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(
        Local.with_ymd_and_hms(2024, 1, 1, 9, 30, 0).unwrap(),
    ));
    let ctx = Arc::new(AppContext::new(&config(dir.path(), 2), clock, None).unwrap());
    let app = ingest_router(ctx.clone());

    let a = report("https://example.com/a", "A");
    let b = report("https://example.com/b", "B");
    let c = report("https://example.com/c", "C");

    let resp = app.clone().oneshot(post(a.clone())).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(ctx.live_count("example.com"), Some(1));

    app.clone().oneshot(post(b.clone())).await.unwrap();
    assert_eq!(ctx.live_count("example.com"), Some(0));

    let archive = dir.path().join("example.com_2024-01-01_0.zip");
    assert_eq!(
        archive_text(&archive, "example.com.txt"),
        format!("{}\n{}\n", a, b)
    );

    app.oneshot(post(c)).await.unwrap();
    assert_eq!(ctx.live_count("example.com"), Some(1));

    let listed = ctx.domain_archives("example.com").unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].file_name, "example.com_2024-01-01_0.zip");
}

#[tokio::test]
async fn test_domains_are_buffered_separately() {
    let dir = tempdir().unwrap();
    let ctx = Arc::new(
        AppContext::new(
            &config(dir.path(), 100),
            Arc::new(ManualClock::new(Local::now())),
            None,
        )
        .unwrap(),
    );
    let app = ingest_router(ctx.clone());

    for i in 0..3 {
        let body = report("https://example.com/", &i.to_string());
        app.clone().oneshot(post(body)).await.unwrap();
    }
    let body = report("https://shop.example.org:8443/cart", "shop");
    app.clone().oneshot(post(body)).await.unwrap();
    let body = report("https://unlisted.test/", "nope");
    app.oneshot(post(body)).await.unwrap();

    assert_eq!(ctx.live_count("example.com"), Some(3));
    assert_eq!(ctx.live_count("shop.example.org"), Some(1));
}

#[tokio::test]
async fn test_unreachable_collector_does_not_block_archival() {
    let dir = tempdir().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let forwarder = Forwarder::new(ForwarderConfig::new(dead_addr, Transport::Tcp));
    let (sender, forwarder_task) = spawn_forwarder(forwarder, 16);

    let clock = Arc::new(ManualClock::new(
        Local.with_ymd_and_hms(2024, 1, 1, 9, 30, 0).unwrap(),
    ));
    let ctx = Arc::new(AppContext::new(&config(dir.path(), 3), clock, Some(sender)).unwrap());
    let app = ingest_router(ctx.clone());

    for marker in ["x", "y", "z"] {
        let resp = app
            .clone()
            .oneshot(post(report("https://example.com/", marker)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    let text = archive_text(
        &dir.path().join("example.com_2024-01-01_0.zip"),
        "example.com.txt",
    );
    assert_eq!(text.lines().count(), 3);

    drop(app);
    drop(ctx);
    let stats = forwarder_task.await.unwrap();
    assert_eq!(stats.sent, 0);
    assert_eq!(stats.dropped, 3);
}

#[tokio::test]
async fn test_daily_tick_scenario() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(
        Local.with_ymd_and_hms(2024, 1, 1, 9, 30, 0).unwrap(),
    ));
    let ctx = AppContext::new(&config(dir.path(), 100), clock.clone(), None).unwrap();
    let agg = ctx.domain("example.com").unwrap();

    for _ in 0..5 {
        agg.append(b"{}");
        agg.flush().unwrap();
    }
    assert_eq!(agg.sequence(), 5);

    clock.advance(Duration::hours(24));
    agg.daily_tick();
    assert_eq!(agg.sequence(), 0);

    agg.append(b"{}");
    clock.advance(Duration::days(STALE_FLUSH_AFTER_DAYS + 1));
    agg.daily_tick();

    assert_eq!(agg.count(), 0);
    assert!(dir.path().join("example.com_2024-02-02_0.zip").exists());
}
