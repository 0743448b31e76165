//! In-memory mailbox store.
//!
//! Default backend for single-node deployments and tests. Records are keyed
//! by request id with the owning mailbox held on the record; reads check the
//! caller's mailbox against it. Records expire after the configured TTL;
//! eviction is lazy and happens on the next access rather than on a timer.
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;

use crate::{
    core::mailbox::{MailboxRequest, MailboxResponse, RequestState, visible_to},
    ports::mailbox_store::{MailboxStore, StoreError},
};

struct Stored<T> {
    record: T,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    requests: HashMap<String, Stored<MailboxRequest>>,
    responses: HashMap<String, Stored<MailboxResponse>>,
}

pub struct InMemoryMailboxStore {
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl InMemoryMailboxStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::Backend("store mutex poisoned".to_string()))?;
        let now = Instant::now();
        inner.requests.retain(|_, s| s.expires_at > now);
        inner.responses.retain(|_, s| s.expires_at > now);
        Ok(inner)
    }
}

#[async_trait]
impl MailboxStore for InMemoryMailboxStore {
    async fn exists(&self, request_id: &str) -> Result<bool, StoreError> {
        let inner = self.lock()?;
        Ok(inner.requests.contains_key(request_id))
    }

    async fn save_request(&self, record: MailboxRequest) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.requests.insert(
            record.request_id.clone(),
            Stored {
                record,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn set_request_state(
        &self,
        mailbox_id: &str,
        request_id: &str,
        state: RequestState,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        match inner
            .requests
            .get_mut(request_id)
            .filter(|s| visible_to(&s.record.mailbox_id, mailbox_id))
        {
            Some(stored) => {
                stored.record.state = state;
                Ok(())
            }
            None => Err(StoreError::Backend(format!(
                "no request '{request_id}' in mailbox '{mailbox_id}'"
            ))),
        }
    }

    async fn save_response(&self, record: MailboxResponse) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.responses.insert(
            record.request_id.clone(),
            Stored {
                record,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn request_state(
        &self,
        mailbox_id: &str,
        request_id: &str,
    ) -> Result<RequestState, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .requests
            .get(request_id)
            .filter(|s| visible_to(&s.record.mailbox_id, mailbox_id))
            .map(|s| s.record.state)
            .unwrap_or(RequestState::Unknown))
    }

    async fn request(
        &self,
        mailbox_id: &str,
        request_id: &str,
    ) -> Result<Option<MailboxRequest>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .requests
            .get(request_id)
            .filter(|s| visible_to(&s.record.mailbox_id, mailbox_id))
            .map(|s| s.record.clone()))
    }

    async fn response(
        &self,
        mailbox_id: &str,
        request_id: &str,
    ) -> Result<Option<MailboxResponse>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .responses
            .get(request_id)
            .filter(|s| visible_to(&s.record.mailbox_id, mailbox_id))
            .map(|s| s.record.clone()))
    }

    async fn requests(&self, mailbox_id: &str) -> Result<Vec<MailboxRequest>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .requests
            .values()
            .filter(|s| s.record.mailbox_id == mailbox_id)
            .map(|s| s.record.clone())
            .collect())
    }

    async fn responses(&self, mailbox_id: &str) -> Result<Vec<MailboxResponse>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .responses
            .values()
            .filter(|s| s.record.mailbox_id == mailbox_id)
            .map(|s| s.record.clone())
            .collect())
    }
}
