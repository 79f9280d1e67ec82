//! Paging behaviour of the REST directory client against a mock server.

mod common;

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{config_for, harness, serve_page, user, DIRECTORY_PATH};
use restfed_core::models::SyncMode;
use restfed_core::{PageFetcher, RestDirectoryClient};

fn fetcher(server: &MockServer) -> PageFetcher {
    let config = config_for(server, "");
    PageFetcher::new(Arc::new(
        RestDirectoryClient::new(&config.remote).expect("client"),
    ))
}

async fn serve_three_pages(server: &MockServer) {
    for page in 1..=3u32 {
        let users = (1..=2)
            .map(|i| {
                let n = (page - 1) * 2 + i;
                user(&format!("u{}", n), &format!("u{}@x.com", n), &[])
            })
            .collect();
        serve_page(server, "full", page, 3, users).await;
    }
}

#[tokio::test]
async fn test_all_pages_are_aggregated_in_order() {
    let server = MockServer::start().await;
    serve_three_pages(&server).await;

    let records = fetcher(&server).fetch_all(&SyncMode::Full).await;
    let names: Vec<_> = records
        .iter()
        .map(|r| r.as_ref().and_then(|r| r.username()).unwrap_or_default())
        .collect();
    assert_eq!(names, vec!["u1", "u2", "u3", "u4", "u5", "u6"]);
}

#[tokio::test]
async fn test_page_size_header_is_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/full", DIRECTORY_PATH)))
        .and(header("X-Page", "1"))
        .and(header("X-Per-Page", "400"))
        .and(header("Accept", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .expect(1)
        .mount(&server)
        .await;

    let records = fetcher(&server).fetch_all(&SyncMode::Full).await;
    assert!(records.is_empty());
}

#[tokio::test]
async fn test_updated_since_uses_minute_precision_path() {
    let server = MockServer::start().await;
    serve_page(
        &server,
        "updated/2024-01-02T03:04Z",
        1,
        1,
        vec![user("alice", "a@x.com", &[])],
    )
    .await;

    let since = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 59).unwrap();
    let records = fetcher(&server)
        .fetch_all(&SyncMode::UpdatedSince(since))
        .await;
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn test_failure_mid_walk_keeps_earlier_pages() {
    let server = MockServer::start().await;
    serve_page(&server, "full", 1, 3, vec![user("u1", "u1@x.com", &[])]).await;
    Mock::given(method("GET"))
        .and(path(format!("{}/full", DIRECTORY_PATH)))
        .and(header("X-Page", "2"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{}/full", DIRECTORY_PATH)))
        .and(header("X-Page", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .expect(0)
        .mount(&server)
        .await;

    let records = fetcher(&server).fetch_all(&SyncMode::Full).await;
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn test_malformed_first_page_yields_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/full", DIRECTORY_PATH)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("{\"error\": \"not a list\"}")
                .insert_header("X-Page", "1")
                .insert_header("X-Total-Pages", "2"),
        )
        .mount(&server)
        .await;

    let records = fetcher(&server).fetch_all(&SyncMode::Full).await;
    assert!(records.is_empty());
}

#[tokio::test]
async fn test_paged_directory_is_fully_imported() {
    let server = MockServer::start().await;
    serve_three_pages(&server).await;
    let h = harness(config_for(&server, ""));

    let result = h.engine.sync_full().await.unwrap();
    assert_eq!(result.added, 6);
    assert_eq!(h.store.list_usernames().unwrap().len(), 6);
}

#[tokio::test]
async fn test_changed_sync_requests_updated_endpoint_after_first_run() {
    let server = MockServer::start().await;
    serve_page(&server, "full", 1, 1, vec![user("alice", "a@x.com", &[])]).await;
    let h = harness(config_for(&server, ""));

    // No previous run: falls back to the full collection.
    let first = h.engine.sync_changed().await.unwrap();
    assert_eq!(first.added, 1);

    let since = h.engine.last_sync_at().unwrap().expect("run recorded");
    let endpoint = format!(
        "updated/{}",
        restfed_core::remote::format_since(&since)
    );
    serve_page(&server, &endpoint, 1, 1, vec![user("bob", "b@x.com", &[])]).await;

    let second = h.engine.sync_changed().await.unwrap();
    assert_eq!((second.added, second.updated), (1, 0));
    assert_eq!(h.store.list_usernames().unwrap(), vec!["alice", "bob"]);
}
