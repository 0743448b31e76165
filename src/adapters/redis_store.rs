//! Redis-backed mailbox store.
//!
//! For multi-node deployments where any gateway instance may answer a poll
//! for a request another instance accepted. Records are JSON values keyed by
//! request id with a server-side TTL; the owning mailbox is held on the
//! record and checked on every read. Per-mailbox sets index the live ids;
//! index entries whose value already expired are cleaned up lazily during
//! listing.
use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    core::mailbox::{MailboxRequest, MailboxResponse, RequestState, visible_to},
    ports::mailbox_store::{MailboxStore, StoreError},
};

pub struct RedisMailboxStore {
    connection: ConnectionManager,
    ttl_secs: u64,
}

impl RedisMailboxStore {
    pub async fn connect(url: &str, ttl: Duration) -> eyre::Result<Self> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        tracing::info!("Connected mailbox store to Redis");
        Ok(Self {
            connection,
            ttl_secs: ttl.as_secs().max(1),
        })
    }

    fn request_key(request_id: &str) -> String {
        format!("mailbox:req:{request_id}")
    }

    fn response_key(request_id: &str) -> String {
        format!("mailbox:resp:{request_id}")
    }

    fn request_index(mailbox_id: &str) -> String {
        format!("mailbox:{mailbox_id}:requests")
    }

    fn response_index(mailbox_id: &str) -> String {
        format!("mailbox:{mailbox_id}:responses")
    }

    async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let json =
            serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut con = self.connection.clone();
        con.set_ex::<_, _, ()>(key, json, self.ttl_secs)
            .await
            .map_err(backend)
    }

    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let mut con = self.connection.clone();
        let json: Option<String> = con.get(key).await.map_err(backend)?;
        match json {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Fetch every live record behind an index set, pruning ids whose record
    /// has expired.
    async fn collect<T: DeserializeOwned>(
        &self,
        index_key: &str,
        record_key: impl Fn(&str) -> String,
    ) -> Result<Vec<T>, StoreError> {
        let mut con = self.connection.clone();
        let ids: Vec<String> = con.smembers(index_key).await.map_err(backend)?;

        let mut records = Vec::with_capacity(ids.len());
        let mut stale = Vec::new();
        for id in ids {
            match self.get::<T>(&record_key(&id)).await? {
                Some(record) => records.push(record),
                None => stale.push(id),
            }
        }
        if !stale.is_empty() {
            con.srem::<_, _, ()>(index_key, stale).await.map_err(backend)?;
        }
        Ok(records)
    }
}

#[async_trait]
impl MailboxStore for RedisMailboxStore {
    async fn exists(&self, request_id: &str) -> Result<bool, StoreError> {
        let mut con = self.connection.clone();
        con.exists(Self::request_key(request_id))
            .await
            .map_err(backend)
    }

    async fn save_request(&self, record: MailboxRequest) -> Result<(), StoreError> {
        let key = Self::request_key(&record.request_id);
        let index = Self::request_index(&record.mailbox_id);
        self.put(&key, &record).await?;

        let mut con = self.connection.clone();
        con.sadd::<_, _, ()>(&index, &record.request_id)
            .await
            .map_err(backend)?;
        con.expire::<_, ()>(&index, self.ttl_secs as i64)
            .await
            .map_err(backend)
    }

    async fn set_request_state(
        &self,
        mailbox_id: &str,
        request_id: &str,
        state: RequestState,
    ) -> Result<(), StoreError> {
        let key = Self::request_key(request_id);
        match self
            .get::<MailboxRequest>(&key)
            .await?
            .filter(|r| visible_to(&r.mailbox_id, mailbox_id))
        {
            Some(mut record) => {
                record.state = state;
                self.put(&key, &record).await
            }
            None => Err(StoreError::Backend(format!(
                "no request '{request_id}' in mailbox '{mailbox_id}'"
            ))),
        }
    }

    async fn save_response(&self, record: MailboxResponse) -> Result<(), StoreError> {
        let key = Self::response_key(&record.request_id);
        let index = Self::response_index(&record.mailbox_id);
        self.put(&key, &record).await?;

        let mut con = self.connection.clone();
        con.sadd::<_, _, ()>(&index, &record.request_id)
            .await
            .map_err(backend)?;
        con.expire::<_, ()>(&index, self.ttl_secs as i64)
            .await
            .map_err(backend)
    }

    async fn request_state(
        &self,
        mailbox_id: &str,
        request_id: &str,
    ) -> Result<RequestState, StoreError> {
        Ok(self
            .get::<MailboxRequest>(&Self::request_key(request_id))
            .await?
            .filter(|r| visible_to(&r.mailbox_id, mailbox_id))
            .map(|r| r.state)
            .unwrap_or(RequestState::Unknown))
    }

    async fn request(
        &self,
        mailbox_id: &str,
        request_id: &str,
    ) -> Result<Option<MailboxRequest>, StoreError> {
        Ok(self
            .get::<MailboxRequest>(&Self::request_key(request_id))
            .await?
            .filter(|r| visible_to(&r.mailbox_id, mailbox_id)))
    }

    async fn response(
        &self,
        mailbox_id: &str,
        request_id: &str,
    ) -> Result<Option<MailboxResponse>, StoreError> {
        Ok(self
            .get::<MailboxResponse>(&Self::response_key(request_id))
            .await?
            .filter(|r| visible_to(&r.mailbox_id, mailbox_id)))
    }

    async fn requests(&self, mailbox_id: &str) -> Result<Vec<MailboxRequest>, StoreError> {
        self.collect(&Self::request_index(mailbox_id), Self::request_key)
            .await
    }

    async fn responses(&self, mailbox_id: &str) -> Result<Vec<MailboxResponse>, StoreError> {
        self.collect(&Self::response_index(mailbox_id), Self::response_key)
            .await
    }
}

fn backend(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}
