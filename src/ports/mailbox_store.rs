//! Durable mailbox storage port.
//!
//! Backs the polling and callback call modes. Request ids are the primary
//! key; reads are scoped by mailbox id so one mailbox can never observe
//! another's records, except for records in the shared sentinel mailbox,
//! which anyone may read. Lookups that miss report `Unknown` state rather
//! than distinguishing "absent" from "foreign".
use async_trait::async_trait;
use thiserror::Error;

use crate::core::mailbox::{MailboxRequest, MailboxResponse, RequestState};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Record serialization error: {0}")]
    Serialization(String),
}

impl From<StoreError> for crate::core::error::GatewayError {
    fn from(err: StoreError) -> Self {
        crate::core::error::GatewayError::Store(err.to_string())
    }
}

#[async_trait]
pub trait MailboxStore: Send + Sync {
    /// Whether a request with this id exists anywhere. Request ids are the
    /// primary key across all mailboxes, so the duplicate guard is global.
    async fn exists(&self, request_id: &str) -> Result<bool, StoreError>;

    /// Persist an accepted request record.
    async fn save_request(&self, record: MailboxRequest) -> Result<(), StoreError>;

    /// Advance the lifecycle state of a stored request.
    async fn set_request_state(
        &self,
        mailbox_id: &str,
        request_id: &str,
        state: RequestState,
    ) -> Result<(), StoreError>;

    /// Persist the outcome (success or error) for a stored request.
    async fn save_response(&self, record: MailboxResponse) -> Result<(), StoreError>;

    /// Current state of a request, `Unknown` when the mailbox holds no such id.
    async fn request_state(
        &self,
        mailbox_id: &str,
        request_id: &str,
    ) -> Result<RequestState, StoreError>;

    async fn request(
        &self,
        mailbox_id: &str,
        request_id: &str,
    ) -> Result<Option<MailboxRequest>, StoreError>;

    async fn response(
        &self,
        mailbox_id: &str,
        request_id: &str,
    ) -> Result<Option<MailboxResponse>, StoreError>;

    /// All request records currently held for a mailbox.
    async fn requests(&self, mailbox_id: &str) -> Result<Vec<MailboxRequest>, StoreError>;

    /// All response records currently held for a mailbox.
    async fn responses(&self, mailbox_id: &str) -> Result<Vec<MailboxResponse>, StoreError>;
}
