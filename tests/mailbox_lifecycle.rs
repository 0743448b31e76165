//! End-to-end lifecycle of polling and callback calls through the mailbox.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, HeaderValue, Method};
use tollgate::{
    config::{GatewayConfig, RouteConfig, ServiceConfig, TransportKind},
    core::{
        callback::{CallbackDispatcher, RESPONSE_STATUS_HEADER},
        error::GatewayError,
        executor::{CommandExecutor, GatewayRequest},
        mailbox::{
            CALL_MODE_HEADER, CALLBACK_URI_HEADER, MAILBOX_ID_HEADER, MAILBOX_NONE,
            MailboxController, RequestState, SubmitOutcome,
        },
        registry::ResilienceRegistry,
        trace::TraceInfo,
    },
    metrics::ExecutionMetrics,
    ports::transport::{DownstreamTransport, TransportError, TransportRequest, TransportResponse},
    InMemoryMailboxStore,
};

/// Records every request it sees and answers 200.
struct RecordingTransport {
    seen: Mutex<Vec<TransportRequest>>,
}

impl RecordingTransport {
    fn new() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<TransportRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl DownstreamTransport for RecordingTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        self.seen.lock().unwrap().push(request);
        Ok(TransportResponse {
            status: 200,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"downstream-ok"),
        })
    }
}

fn gateway_config() -> GatewayConfig {
    let mut routes = HashMap::new();
    routes.insert("detail".to_string(), RouteConfig::new("/orders"));
    let mut services = HashMap::new();
    services.insert(
        "orders".to_string(),
        ServiceConfig {
            endpoint: "http://orders:8080".to_string(),
            transport: TransportKind::Plain,
            auth_header: None,
            routes,
            pools: HashMap::new(),
            default_pool: None,
        },
    );
    GatewayConfig {
        services,
        ..GatewayConfig::default()
    }
}

fn controller(transport: Arc<RecordingTransport>) -> MailboxController {
    let config = gateway_config();
    let registry = Arc::new(ResilienceRegistry::new(&config));
    let shared = Arc::new(ArcSwap::from_pointee(config));
    let executor = CommandExecutor::new(
        shared.clone(),
        registry,
        transport,
        Arc::new(ExecutionMetrics::new()),
    );
    let callbacks = Arc::new(CallbackDispatcher::new(executor.clone(), shared));
    let store = Arc::new(InMemoryMailboxStore::new(Duration::from_secs(60)));
    MailboxController::new(executor, store, callbacks)
}

fn request(request_id: &str, extra: &[(&str, &str)]) -> GatewayRequest {
    let mut headers = HeaderMap::new();
    for (name, value) in extra {
        headers.insert(
            http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    GatewayRequest {
        service: "orders".to_string(),
        path: "/orders/42".to_string(),
        method: Method::GET,
        headers,
        body: Bytes::new(),
        trace: TraceInfo {
            request_id: request_id.to_string(),
            transaction_id: "txn-1".to_string(),
            parent_request_id: None,
            timestamp: Utc::now(),
        },
    }
}

async fn wait_for_state(
    controller: &MailboxController,
    mailbox_id: &str,
    request_id: &str,
    wanted: RequestState,
) {
    for _ in 0..100 {
        let state = controller
            .request_state(mailbox_id, request_id)
            .await
            .unwrap();
        if state == wanted {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("request '{request_id}' never reached {wanted:?}");
}

#[tokio::test]
async fn inline_call_completes_on_the_connection() {
    let controller = controller(Arc::new(RecordingTransport::new()));
    let outcome = controller.submit(request("req-inline", &[])).await.unwrap();
    match outcome {
        SubmitOutcome::Completed(response) => {
            assert_eq!(response.status, 200);
            assert_eq!(response.body, Bytes::from_static(b"downstream-ok"));
        }
        SubmitOutcome::Accepted { .. } => panic!("inline call must not detach"),
    }
}

#[tokio::test]
async fn polling_lifecycle_runs_to_read() {
    let controller = controller(Arc::new(RecordingTransport::new()));

    let outcome = controller
        .submit(request(
            "req-poll",
            &[(CALL_MODE_HEADER, "polling"), (MAILBOX_ID_HEADER, "client-1")],
        ))
        .await
        .unwrap();
    let SubmitOutcome::Accepted { request_id } = outcome else {
        panic!("polling call must be accepted");
    };
    assert_eq!(request_id, "req-poll");

    wait_for_state(&controller, "client-1", "req-poll", RequestState::Responded).await;

    let stored = controller
        .fetch_response("client-1", "req-poll")
        .await
        .unwrap()
        .expect("responded request has a stored outcome");
    assert_eq!(stored.status, 200);
    assert_eq!(stored.body, b"downstream-ok");
    assert!(stored.error_kind.is_none());

    // Fetching alone leaves the outcome unconsumed.
    assert_eq!(
        controller
            .request_state("client-1", "req-poll")
            .await
            .unwrap(),
        RequestState::Responded
    );

    // An explicit ack consumes it; a second ack is a client error.
    assert_eq!(
        controller.acknowledge("client-1", "req-poll").await.unwrap(),
        RequestState::Read
    );
    assert_eq!(
        controller
            .request_state("client-1", "req-poll")
            .await
            .unwrap(),
        RequestState::Read
    );
    let err = controller
        .acknowledge("client-1", "req-poll")
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::BadRequest(_)));

    let requests = controller.list_requests("client-1").await.unwrap();
    assert_eq!(requests.len(), 1);
    let responses = controller.list_responses("client-1").await.unwrap();
    assert_eq!(responses.len(), 1);
}

#[tokio::test]
async fn duplicate_request_id_is_rejected() {
    let controller = controller(Arc::new(RecordingTransport::new()));
    let headers = [(CALL_MODE_HEADER, "polling"), (MAILBOX_ID_HEADER, "client-1")];

    controller
        .submit(request("req-dup", &headers))
        .await
        .unwrap();
    let err = controller
        .submit(request("req-dup", &headers))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::DuplicateRequest { .. }));
}

#[tokio::test]
async fn foreign_mailbox_sees_unknown() {
    let controller = controller(Arc::new(RecordingTransport::new()));

    controller
        .submit(request(
            "req-mine",
            &[(CALL_MODE_HEADER, "polling"), (MAILBOX_ID_HEADER, "client-1")],
        ))
        .await
        .unwrap();
    wait_for_state(&controller, "client-1", "req-mine", RequestState::Responded).await;

    // Another mailbox learns nothing about the id.
    assert_eq!(
        controller
            .request_state("client-2", "req-mine")
            .await
            .unwrap(),
        RequestState::Unknown
    );
    assert!(
        controller
            .fetch_response("client-2", "req-mine")
            .await
            .unwrap()
            .is_none()
    );
    assert!(controller.list_requests("client-2").await.unwrap().is_empty());
}

#[tokio::test]
async fn polling_without_mailbox_id_uses_the_shared_mailbox() {
    let controller = controller(Arc::new(RecordingTransport::new()));
    let outcome = controller
        .submit(request("req-unscoped", &[(CALL_MODE_HEADER, "polling")]))
        .await
        .unwrap();
    assert!(matches!(outcome, SubmitOutcome::Accepted { .. }));

    wait_for_state(
        &controller,
        MAILBOX_NONE,
        "req-unscoped",
        RequestState::Responded,
    )
    .await;

    // Unscoped records are readable from any mailbox.
    assert_eq!(
        controller
            .request_state("client-7", "req-unscoped")
            .await
            .unwrap(),
        RequestState::Responded
    );
    assert!(
        controller
            .fetch_response("client-7", "req-unscoped")
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn duplicate_request_id_is_rejected_across_mailboxes() {
    let controller = controller(Arc::new(RecordingTransport::new()));

    controller
        .submit(request(
            "req-shared-id",
            &[(CALL_MODE_HEADER, "polling"), (MAILBOX_ID_HEADER, "client-1")],
        ))
        .await
        .unwrap();

    // The request id is the primary key; a different mailbox cannot reuse it.
    let err = controller
        .submit(request(
            "req-shared-id",
            &[(CALL_MODE_HEADER, "polling"), (MAILBOX_ID_HEADER, "client-2")],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::DuplicateRequest { .. }));
}

#[tokio::test]
async fn callback_mode_pushes_the_outcome() {
    let transport = Arc::new(RecordingTransport::new());
    let controller = controller(transport.clone());

    controller
        .submit(request(
            "req-cb",
            &[
                (CALL_MODE_HEADER, "callback"),
                (MAILBOX_ID_HEADER, "client-1"),
                (CALLBACK_URI_HEADER, "http://client.example:9000/hook"),
            ],
        ))
        .await
        .unwrap();

    wait_for_state(&controller, "client-1", "req-cb", RequestState::Responded).await;

    // The routed call and the callback delivery both hit the transport.
    let mut calls = Vec::new();
    for _ in 0..100 {
        calls = transport.calls();
        if calls.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(calls.len(), 2, "callback delivery never happened");

    let delivery = &calls[1];
    assert_eq!(delivery.uri, "http://client.example:9000/hook");
    assert_eq!(delivery.method, Method::POST);
    assert_eq!(delivery.body, Bytes::from_static(b"downstream-ok"));
    assert_eq!(
        delivery.headers.get(RESPONSE_STATUS_HEADER).unwrap(),
        "200"
    );
    assert_eq!(delivery.headers.get(MAILBOX_ID_HEADER).unwrap(), "client-1");
}

#[tokio::test]
async fn callback_mode_requires_a_callback_uri() {
    let controller = controller(Arc::new(RecordingTransport::new()));
    let err = controller
        .submit(request(
            "req-cb-bad",
            &[(CALL_MODE_HEADER, "callback"), (MAILBOX_ID_HEADER, "client-1")],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::BadRequest(_)));
}

#[tokio::test]
async fn ack_of_an_unknown_id_reports_unknown() {
    let controller = controller(Arc::new(RecordingTransport::new()));
    assert_eq!(
        controller.acknowledge("client-1", "req-none").await.unwrap(),
        RequestState::Unknown
    );
    assert!(
        !controller
            .complete_external("client-1", "req-none", 200, Vec::new())
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn external_outcome_completes_a_callback_request() {
    /// Hangs on gateway-routed calls; answers callback deliveries promptly.
    struct SelectiveTransport {
        seen: Mutex<Vec<TransportRequest>>,
    }

    #[async_trait]
    impl DownstreamTransport for SelectiveTransport {
        async fn send(
            &self,
            request: TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            if request.uri.starts_with("http://orders") {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            self.seen.lock().unwrap().push(request);
            Ok(TransportResponse {
                status: 200,
                headers: HeaderMap::new(),
                body: Bytes::new(),
            })
        }
    }

    let transport = Arc::new(SelectiveTransport {
        seen: Mutex::new(Vec::new()),
    });
    let config = gateway_config();
    let registry = Arc::new(ResilienceRegistry::new(&config));
    let shared = Arc::new(ArcSwap::from_pointee(config));
    let executor = CommandExecutor::new(
        shared.clone(),
        registry,
        transport.clone(),
        Arc::new(ExecutionMetrics::new()),
    );
    let callbacks = Arc::new(CallbackDispatcher::new(executor.clone(), shared));
    let store = Arc::new(InMemoryMailboxStore::new(Duration::from_secs(60)));
    let controller = MailboxController::new(executor, store, callbacks);

    controller
        .submit(request(
            "req-ext",
            &[
                (CALL_MODE_HEADER, "callback"),
                (MAILBOX_ID_HEADER, "client-1"),
                (CALLBACK_URI_HEADER, "http://client.example:9000/hook"),
            ],
        ))
        .await
        .unwrap();
    wait_for_state(&controller, "client-1", "req-ext", RequestState::Requested).await;

    // The downstream pushes its result back instead of answering the call.
    assert!(
        controller
            .complete_external("client-1", "req-ext", 201, b"pushed".to_vec())
            .await
            .unwrap()
    );
    assert_eq!(
        controller
            .request_state("client-1", "req-ext")
            .await
            .unwrap(),
        RequestState::Responded
    );

    let stored = controller
        .fetch_response("client-1", "req-ext")
        .await
        .unwrap()
        .expect("pushed outcome is stored");
    assert_eq!(stored.status, 201);
    assert_eq!(stored.body, b"pushed");

    // The pushed outcome is relayed to the callback target.
    let mut calls = Vec::new();
    for _ in 0..100 {
        calls = transport.seen.lock().unwrap().clone();
        if !calls.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(calls.len(), 1, "callback delivery never happened");
    assert_eq!(calls[0].uri, "http://client.example:9000/hook");
    assert_eq!(calls[0].body, Bytes::from_static(b"pushed"));
    assert_eq!(calls[0].headers.get(RESPONSE_STATUS_HEADER).unwrap(), "201");
}

#[tokio::test]
async fn failed_detached_call_records_an_error_outcome() {
    struct FailingTransport;

    #[async_trait]
    impl DownstreamTransport for FailingTransport {
        async fn send(
            &self,
            _request: TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            Err(TransportError::Connection("refused".to_string()))
        }
    }

    let config = gateway_config();
    let registry = Arc::new(ResilienceRegistry::new(&config));
    let shared = Arc::new(ArcSwap::from_pointee(config));
    let executor = CommandExecutor::new(
        shared.clone(),
        registry,
        Arc::new(FailingTransport),
        Arc::new(ExecutionMetrics::new()),
    );
    let callbacks = Arc::new(CallbackDispatcher::new(executor.clone(), shared));
    let store = Arc::new(InMemoryMailboxStore::new(Duration::from_secs(60)));
    let controller = MailboxController::new(executor, store, callbacks);

    controller
        .submit(request(
            "req-fail",
            &[(CALL_MODE_HEADER, "polling"), (MAILBOX_ID_HEADER, "client-1")],
        ))
        .await
        .unwrap();

    wait_for_state(&controller, "client-1", "req-fail", RequestState::Error).await;

    let stored = controller
        .fetch_response("client-1", "req-fail")
        .await
        .unwrap()
        .expect("failed request still stores an outcome");
    assert_eq!(stored.status, 502);
    assert!(stored.error_kind.is_some());
}
