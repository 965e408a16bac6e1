mod common;

use std::sync::Arc;

use common::{MockQueueClient, init_tracing, queue_url};
use futures::future::join_all;
use rs_sqs_listener::destination::CachingDestinationResolver;
use rs_sqs_listener::errors::SqsListenerError;

#[tokio::test]
async fn concurrent_first_resolutions_share_one_lookup() {
    init_tracing();
    let client = MockQueueClient::new();
    client.with_queue("orders");
    let resolver = CachingDestinationResolver::new(client.clone());

    let results = join_all((0..10).map(|_| resolver.resolve("orders"))).await;

    for result in results {
        assert_eq!(result.unwrap(), queue_url("orders"));
    }
    assert_eq!(client.get_queue_url_calls(), 1);

    resolver.resolve("orders").await.unwrap();
    assert_eq!(client.get_queue_url_calls(), 1);
    assert_eq!(resolver.cached_count(), 1);
}

#[tokio::test]
async fn queue_urls_are_returned_without_lookup() {
    let client = MockQueueClient::new();
    let resolver = CachingDestinationResolver::new(client.clone());
    let url = "http://localhost:4566/000000000000/orders";

    assert_eq!(resolver.resolve(url).await.unwrap(), url);
    assert_eq!(client.get_queue_url_calls(), 0);
}

#[tokio::test]
async fn arn_is_resolved_in_the_owning_account() {
    let client = MockQueueClient::new();
    client.with_queue("orders");
    let resolver = CachingDestinationResolver::new(client.clone());

    let url = resolver
        .resolve("arn:aws:sqs:us-east-1:123456789012:orders")
        .await
        .unwrap();

    assert_eq!(url, queue_url("orders"));
    assert_eq!(client.owners(), vec![Some("123456789012".to_string())]);
}

#[tokio::test]
async fn missing_queue_is_an_invalid_destination() {
    let client = MockQueueClient::new();
    let resolver = CachingDestinationResolver::new(client.clone());

    match resolver.resolve("missing").await {
        Err(SqsListenerError::InvalidDestination { name, .. }) => assert_eq!(name, "missing"),
        other => panic!("expected InvalidDestination, got {other:?}"),
    }
    assert_eq!(client.create_queue_calls(), 0);
}

#[tokio::test]
async fn missing_queue_is_created_when_enabled() {
    let client = MockQueueClient::new();
    let resolver = CachingDestinationResolver::new(client.clone()).with_auto_create(true);

    let results = join_all((0..5).map(|_| resolver.resolve("fresh"))).await;

    for result in results {
        assert_eq!(result.unwrap(), queue_url("fresh"));
    }
    assert_eq!(client.get_queue_url_calls(), 1);
    assert_eq!(client.create_queue_calls(), 1);
}

#[tokio::test]
async fn failed_lookups_are_not_cached() {
    let client = MockQueueClient::new();
    client.with_queue("orders");
    client.fail_next_lookups(1);
    let resolver = CachingDestinationResolver::new(client.clone());

    assert!(resolver.resolve("orders").await.is_err());
    assert_eq!(resolver.resolve("orders").await.unwrap(), queue_url("orders"));
    assert_eq!(client.get_queue_url_calls(), 2);
}

#[tokio::test]
async fn endpoint_keeps_its_first_resolved_url() {
    use rs_sqs_listener::container::{ContainerOptions, QueueEndpoint};

    let client = MockQueueClient::new();
    client.with_queue("orders");
    let resolver = Arc::new(CachingDestinationResolver::new(client.clone()));
    let endpoint = QueueEndpoint::new("orders", ContainerOptions::default()).unwrap();

    assert_eq!(endpoint.queue_url(), None);
    let first = endpoint.resolve_url(&resolver).await.unwrap();
    let second = endpoint.resolve_url(&resolver).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(endpoint.queue_url().as_deref(), Some(queue_url("orders").as_str()));
    assert_eq!(client.get_queue_url_calls(), 1);
}
