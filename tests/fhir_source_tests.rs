mod test_utils;

use fhir_lake_sync::config::SourceConfig;
use fhir_lake_sync::source::{DataSource, FhirApiDataSource, SourceError};
use serde_json::json;
use test_utils::{period, utc};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{header, method, path, query_param},
};

fn source_for(server: &MockServer) -> FhirApiDataSource {
    FhirApiDataSource::new(&SourceConfig {
        base_url: format!("{}/fhir", server.uri()),
        page_size: 2,
        request_timeout_seconds: 5,
        resource_types: vec!["Patient".to_string()],
    })
    .unwrap()
}

#[tokio::test]
async fn test_search_pages_through_next_links() {
    let mock_server = MockServer::start().await;
    let next_link = format!("{}/fhir?_getpages=abc&_getpagesoffset=2", mock_server.uri());

    Mock::given(method("GET"))
        .and(path("/fhir/Patient"))
        .and(header("accept", "application/fhir+json"))
        .and(query_param("_lastUpdated", "ge2021-01-01T00:00:00Z"))
        .and(query_param("_lastUpdated", "lt2021-01-02T00:00:00Z"))
        .and(query_param("_count", "2"))
        .and(query_param("_sort", "_lastUpdated"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "link": [
                { "relation": "self", "url": format!("{}/fhir/Patient", mock_server.uri()) },
                { "relation": "next", "url": next_link },
            ],
            "entry": [
                { "resource": { "resourceType": "Patient", "id": "p1" } },
                { "resource": { "resourceType": "Patient", "id": "p2" } },
            ]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/fhir"))
        .and(query_param("_getpages", "abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "entry": [
                { "resource": { "resourceType": "Patient", "id": "p3" } },
            ]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let source = source_for(&mock_server);
    let day = period(utc(2021, 1, 1, 0), utc(2021, 1, 2, 0));

    let first = source.fetch("Patient", &day, None).await.unwrap();
    assert_eq!(first.records.len(), 2);
    assert_eq!(first.records[0]["id"], "p1");
    assert_eq!(first.next_continuation_token.as_deref(), Some(next_link.as_str()));

    let second = source
        .fetch("Patient", &day, first.next_continuation_token.as_deref())
        .await
        .unwrap();
    assert_eq!(second.records.len(), 1);
    assert_eq!(second.records[0]["id"], "p3");
    assert_eq!(second.next_continuation_token, None);
}

#[tokio::test]
async fn test_empty_bundle_ends_the_search() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fhir/Observation"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "total": 0
        })))
        .mount(&mock_server)
        .await;

    let page = source_for(&mock_server)
        .fetch("Observation", &period(utc(2021, 1, 1, 0), utc(2021, 1, 2, 0)), None)
        .await
        .unwrap();
    assert!(page.records.is_empty());
    assert_eq!(page.next_continuation_token, None);
}

#[tokio::test]
async fn test_error_statuses_are_classified() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "12"))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Observation"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Unknown"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let source = source_for(&mock_server);
    let day = period(utc(2021, 1, 1, 0), utc(2021, 1, 2, 0));

    let throttled = source.fetch("Patient", &day, None).await.unwrap_err();
    assert_eq!(throttled, SourceError::throttled(Some(12)));

    let unavailable = source.fetch("Observation", &day, None).await.unwrap_err();
    assert!(matches!(&unavailable, SourceError::Transient(message) if message.contains("maintenance")));
    assert!(unavailable.is_retriable());

    let missing = source.fetch("Unknown", &day, None).await.unwrap_err();
    assert!(matches!(missing, SourceError::Fatal(_)));
    assert!(!missing.is_retriable());
}

#[tokio::test]
async fn test_malformed_bundle_is_fatal() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not fhir</html>"))
        .mount(&mock_server)
        .await;

    let err = source_for(&mock_server)
        .fetch("Patient", &period(utc(2021, 1, 1, 0), utc(2021, 1, 2, 0)), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SourceError::Fatal(message) if message.contains("malformed")));
}

#[tokio::test]
async fn test_continuation_link_must_stay_on_server() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "resourceType": "Bundle" })))
        .expect(0)
        .mount(&mock_server)
        .await;

    let err = source_for(&mock_server)
        .fetch(
            "Patient",
            &period(utc(2021, 1, 1, 0), utc(2021, 1, 2, 0)),
            Some("https://elsewhere.example.org/fhir?_getpages=abc"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SourceError::Fatal(message) if message.contains("leaves the configured server")));
}

#[test]
fn test_invalid_base_url_is_rejected() {
    let result = FhirApiDataSource::new(&SourceConfig {
        base_url: "not a url".to_string(),
        ..SourceConfig::default()
    });
    assert!(matches!(result, Err(SourceError::Fatal(_))));
}
