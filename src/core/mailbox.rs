//! Mailbox call modes and request lifecycle.
//!
//! Inline calls answer on the request connection. Polling and callback calls
//! are accepted, persisted, and executed detached; the caller (or its
//! callback endpoint) picks the outcome up later. Records are scoped to the
//! submitting mailbox, and lookups against someone else's mailbox answer
//! `Unknown` rather than revealing whether the id exists at all. The mailbox
//! id is an optional grouping key: submissions without one land in the shared
//! sentinel mailbox and are readable by anyone. Request ids are unique across
//! all mailboxes.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::{
    core::{
        callback::CallbackDispatcher,
        error::{GatewayError, GatewayResult},
        executor::{CommandExecutor, GatewayRequest, GatewayResponse},
        trace::TraceInfo,
    },
    metrics,
    ports::mailbox_store::MailboxStore,
};

pub const CALL_MODE_HEADER: &str = "x-call-mode";
pub const MAILBOX_ID_HEADER: &str = "x-mailbox-id";
pub const CALLBACK_URI_HEADER: &str = "x-callback-uri";

/// Sentinel mailbox for submissions that carry no mailbox id.
pub const MAILBOX_NONE: &str = "none";

/// Whether a record owned by `owner` may be served to `caller`. Records in
/// the sentinel mailbox are visible to everyone.
pub fn visible_to(owner: &str, caller: &str) -> bool {
    owner == MAILBOX_NONE || owner == caller
}

/// How the caller wants the answer delivered.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    Inline,
    Polling,
    Callback,
}

impl CallMode {
    /// Parse the call mode header; absent means inline.
    pub fn from_headers(headers: &HeaderMap) -> GatewayResult<Self> {
        let Some(value) = headers.get(CALL_MODE_HEADER) else {
            return Ok(CallMode::Inline);
        };
        match value.to_str().map(str::to_ascii_lowercase).as_deref() {
            Ok("inline") => Ok(CallMode::Inline),
            Ok("polling") => Ok(CallMode::Polling),
            Ok("callback") => Ok(CallMode::Callback),
            _ => Err(GatewayError::BadRequest(format!(
                "unsupported call mode '{}'",
                value.to_str().unwrap_or("<binary>")
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallMode::Inline => "inline",
            CallMode::Polling => "polling",
            CallMode::Callback => "callback",
        }
    }
}

/// Lifecycle of a stored request.
///
/// `Unknown` is what a mailbox sees for ids it does not own; it is never
/// persisted.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestState {
    Received,
    Requested,
    Responded,
    Error,
    Read,
    Unknown,
}

/// Persisted form of an accepted request.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MailboxRequest {
    pub mailbox_id: String,
    pub request_id: String,
    pub transaction_id: String,
    pub service: String,
    pub path: String,
    pub method: String,
    pub body: Vec<u8>,
    pub mode: CallMode,
    pub callback_uri: Option<String>,
    pub state: RequestState,
    pub received_at: DateTime<Utc>,
}

/// Persisted outcome of a request, success or error.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MailboxResponse {
    pub mailbox_id: String,
    pub request_id: String,
    pub status: u16,
    pub body: Vec<u8>,
    /// Error tag when the call failed; `None` for successful outcomes.
    pub error_kind: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// What `submit` hands back to the HTTP layer.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// Inline call: the downstream answer, ready to relay.
    Completed(GatewayResponse),
    /// Polling or callback call: accepted, work continues detached.
    Accepted { request_id: String },
}

pub struct MailboxController {
    executor: CommandExecutor,
    store: Arc<dyn MailboxStore>,
    callbacks: Arc<CallbackDispatcher>,
}

impl MailboxController {
    pub fn new(
        executor: CommandExecutor,
        store: Arc<dyn MailboxStore>,
        callbacks: Arc<CallbackDispatcher>,
    ) -> Self {
        Self {
            executor,
            store,
            callbacks,
        }
    }

    /// Entry point for every routed call, regardless of mode.
    pub async fn submit(&self, request: GatewayRequest) -> GatewayResult<SubmitOutcome> {
        let mode = CallMode::from_headers(&request.headers)?;
        metrics::increment_mailbox_request(mode.as_str());

        if mode == CallMode::Inline {
            let response = self.executor.execute(request).await?;
            return Ok(SubmitOutcome::Completed(response));
        }

        let mailbox_id = optional_header(&request.headers, MAILBOX_ID_HEADER)
            .unwrap_or_else(|| MAILBOX_NONE.to_string());
        let callback_uri = match mode {
            CallMode::Callback => Some(required_header(&request.headers, CALLBACK_URI_HEADER)?),
            _ => None,
        };

        // Request ids are the primary key: a duplicate is rejected no matter
        // which mailbox it arrives under.
        let request_id = request.trace.request_id.clone();
        if self.store.exists(&request_id).await? {
            return Err(GatewayError::DuplicateRequest { id: request_id });
        }

        let record = MailboxRequest {
            mailbox_id: mailbox_id.clone(),
            request_id: request_id.clone(),
            transaction_id: request.trace.transaction_id.clone(),
            service: request.service.clone(),
            path: request.path.clone(),
            method: request.method.to_string(),
            body: request.body.to_vec(),
            mode,
            callback_uri: callback_uri.clone(),
            state: RequestState::Received,
            received_at: Utc::now(),
        };
        self.store.save_request(record).await?;

        let executor = self.executor.clone();
        let store = self.store.clone();
        let callbacks = self.callbacks.clone();
        let accepted_id = request_id.clone();
        let overrides = request.headers.clone();
        tokio::spawn(async move {
            process_detached(
                executor,
                store,
                callbacks,
                request,
                overrides,
                mailbox_id,
                request_id,
                callback_uri,
            )
            .await;
        });

        Ok(SubmitOutcome::Accepted {
            request_id: accepted_id,
        })
    }

    /// Current lifecycle state; `Unknown` for ids this mailbox does not hold.
    pub async fn request_state(
        &self,
        mailbox_id: &str,
        request_id: &str,
    ) -> GatewayResult<RequestState> {
        Ok(self.store.request_state(mailbox_id, request_id).await?)
    }

    /// Fetch a stored outcome. Fetching does not consume it; the caller
    /// acknowledges separately once the outcome has been handled.
    pub async fn fetch_response(
        &self,
        mailbox_id: &str,
        request_id: &str,
    ) -> GatewayResult<Option<MailboxResponse>> {
        Ok(self.store.response(mailbox_id, request_id).await?)
    }

    /// Acknowledge a delivered outcome, moving the request to `Read`.
    ///
    /// Only terminal states accept an ack; anything else is a client error,
    /// and an id this mailbox does not hold reports `Unknown`.
    pub async fn acknowledge(
        &self,
        mailbox_id: &str,
        request_id: &str,
    ) -> GatewayResult<RequestState> {
        match self.store.request_state(mailbox_id, request_id).await? {
            RequestState::Responded | RequestState::Error => {
                self.store
                    .set_request_state(mailbox_id, request_id, RequestState::Read)
                    .await?;
                Ok(RequestState::Read)
            }
            RequestState::Unknown => Ok(RequestState::Unknown),
            other => Err(GatewayError::BadRequest(format!(
                "request '{request_id}' is {other:?}, not awaiting acknowledgment"
            ))),
        }
    }

    /// Record an outcome produced outside the gateway, e.g. a downstream
    /// system pushing its result back instead of answering the original call.
    ///
    /// Returns `false` when the mailbox holds no such request. If the original
    /// submission asked for callback delivery, the pushed outcome is relayed
    /// onward just like an internally produced one.
    pub async fn complete_external(
        &self,
        mailbox_id: &str,
        request_id: &str,
        status: u16,
        body: Vec<u8>,
    ) -> GatewayResult<bool> {
        let Some(record) = self.store.request(mailbox_id, request_id).await? else {
            return Ok(false);
        };

        let response = MailboxResponse {
            mailbox_id: mailbox_id.to_string(),
            request_id: request_id.to_string(),
            status,
            body,
            error_kind: None,
            completed_at: Utc::now(),
        };
        self.store.save_response(response.clone()).await?;
        self.store
            .set_request_state(mailbox_id, request_id, RequestState::Responded)
            .await?;

        if record.mode == CallMode::Callback
            && let Some(uri) = record.callback_uri
        {
            let trace = TraceInfo {
                request_id: record.request_id,
                transaction_id: record.transaction_id,
                parent_request_id: None,
                timestamp: Utc::now(),
            };
            self.callbacks
                .deliver(&uri, &HeaderMap::new(), &trace, &response)
                .await;
        }
        Ok(true)
    }

    pub async fn list_requests(&self, mailbox_id: &str) -> GatewayResult<Vec<MailboxRequest>> {
        Ok(self.store.requests(mailbox_id).await?)
    }

    pub async fn list_responses(&self, mailbox_id: &str) -> GatewayResult<Vec<MailboxResponse>> {
        Ok(self.store.responses(mailbox_id).await?)
    }
}

async fn process_detached(
    executor: CommandExecutor,
    store: Arc<dyn MailboxStore>,
    callbacks: Arc<CallbackDispatcher>,
    request: GatewayRequest,
    overrides: http::HeaderMap,
    mailbox_id: String,
    request_id: String,
    callback_uri: Option<String>,
) {
    if let Err(err) = store
        .set_request_state(&mailbox_id, &request_id, RequestState::Requested)
        .await
    {
        tracing::error!(%mailbox_id, %request_id, error = %err, "Failed to advance request state");
        return;
    }

    let trace = request.trace.clone();
    let outcome = executor.execute(request).await;

    let (response, final_state) = match outcome {
        Ok(response) => (
            MailboxResponse {
                mailbox_id: mailbox_id.clone(),
                request_id: request_id.clone(),
                status: response.status,
                body: response.body.to_vec(),
                error_kind: None,
                completed_at: Utc::now(),
            },
            RequestState::Responded,
        ),
        Err(err) => (
            MailboxResponse {
                mailbox_id: mailbox_id.clone(),
                request_id: request_id.clone(),
                status: err.status_code().as_u16(),
                body: serde_json::json!({
                    "error": err.kind(),
                    "message": err.to_string(),
                })
                .to_string()
                .into_bytes(),
                error_kind: Some(err.kind().to_string()),
                completed_at: Utc::now(),
            },
            RequestState::Error,
        ),
    };

    if let Err(err) = store.save_response(response.clone()).await {
        tracing::error!(%mailbox_id, %request_id, error = %err, "Failed to persist response");
        return;
    }
    if let Err(err) = store
        .set_request_state(&mailbox_id, &request_id, final_state)
        .await
    {
        tracing::error!(%mailbox_id, %request_id, error = %err, "Failed to advance request state");
    }

    if let Some(uri) = callback_uri {
        callbacks.deliver(&uri, &overrides, &trace, &response).await;
    }
}

fn optional_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn required_header(headers: &HeaderMap, name: &str) -> GatewayResult<String> {
    optional_header(headers, name)
        .ok_or_else(|| GatewayError::BadRequest(format!("missing required header '{name}'")))
}
