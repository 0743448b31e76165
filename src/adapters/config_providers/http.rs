use std::time::Duration;

use async_trait::async_trait;
use eyre::{Context, Result};
use reqwest::Client;
use tokio::sync::mpsc;

use crate::{config::GatewayConfig, ports::config_provider::ConfigProvider};

/// Configuration provider that fetches from an HTTP URL and polls for changes.
pub struct HttpConfigProvider {
    url: String,
    client: Client,
    update_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl HttpConfigProvider {
    pub fn new(url: String, poll_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        let provider = Self {
            url: url.clone(),
            client: client.clone(),
            update_rx: std::sync::Mutex::new(Some(rx)),
        };

        // Start polling task
        tokio::spawn(async move {
            let mut last_config_hash: Option<u64> = None;
            let mut interval = tokio::time::interval(poll_interval);

            loop {
                interval.tick().await;

                // Fetch config to check for changes (naive approach: fetch & hash)
                // In a real system, use ETag or Last-Modified
                match Self::fetch_config(&client, &url).await {
                    Ok(config) => {
                        use std::{
                            collections::hash_map::DefaultHasher,
                            hash::{Hash, Hasher},
                        };

                        // Serialize to JSON and hash that instead of deriving
                        // Hash on the whole config tree.
                        if let Ok(json) = serde_json::to_string(&config) {
                            let mut hasher = DefaultHasher::new();
                            json.hash(&mut hasher);
                            let new_hash = hasher.finish();

                            if let Some(last) = last_config_hash {
                                if last != new_hash {
                                    tracing::info!("Remote configuration changed");
                                    let _ = tx.try_send(());
                                    last_config_hash = Some(new_hash);
                                }
                            } else {
                                last_config_hash = Some(new_hash);
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to poll remote config: {}", e);
                    }
                }
            }
        });

        provider
    }

    async fn fetch_config(client: &Client, url: &str) -> Result<GatewayConfig> {
        let resp = client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;
        let config = resp
            .json::<GatewayConfig>()
            .await
            .context("Failed to parse JSON config")?;
        Ok(config)
    }
}

#[async_trait]
impl ConfigProvider for HttpConfigProvider {
    async fn load_config(&self) -> Result<GatewayConfig> {
        Self::fetch_config(&self.client, &self.url).await
    }

    fn watch(&self) -> mpsc::Receiver<()> {
        self.update_rx
            .lock()
            .expect("failed to lock update_rx mutex")
            .take()
            .expect("Watch can only be called once")
    }
}
