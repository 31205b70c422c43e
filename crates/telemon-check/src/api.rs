use crate::broker::{BrokerConfig, CheckMeta, ReverseConfigs, ReverseUrl};
use crate::error::{ResolverError, Result};
use crate::resolver::Resolver;
use crate::tls;
use async_trait::async_trait;
use rustls::ClientConfig;
use serde::Deserialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;

const API_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ApiOptions {
    /// Management API base URL, e.g. `https://api.example.com`.
    pub base_url: String,
    pub token: String,
    pub check_uuid: String,
    /// Broker CA: PEM path, inline PEM, or empty for web trust roots.
    pub broker_ca: String,
    /// Management API CA: same forms as `broker_ca`.
    pub api_ca: String,
}

/// Check bundle document as served by the management API.
#[derive(Debug, Deserialize)]
struct CheckBundleDoc {
    bundle_id: String,
    check_id: String,
    check_uuid: String,
    brokers: Vec<BrokerDoc>,
}

#[derive(Debug, Deserialize)]
struct BrokerDoc {
    id: String,
    cn: String,
    #[serde(default)]
    address: Option<String>,
    reverse_url: String,
}

#[derive(Debug, Deserialize)]
struct OwnerDoc {
    cn: String,
}

struct Bundle {
    meta: CheckMeta,
    configs: ReverseConfigs,
}

/// [`Resolver`] backed by the management API. Caches the last loaded bundle;
/// `refresh_reverse_config` replaces the cache wholesale.
pub struct ApiResolver {
    client: reqwest::Client,
    base_url: String,
    token: String,
    check_uuid: String,
    broker_tls: Arc<ClientConfig>,
    cached: RwLock<Option<Bundle>>,
}

impl ApiResolver {
    pub fn new(opts: ApiOptions) -> Result<Self> {
        let broker_tls = tls::client_config(&opts.broker_ca)?;

        let mut builder = reqwest::Client::builder().timeout(API_TIMEOUT);
        if !opts.api_ca.trim().is_empty() {
            let pem = if opts.api_ca.contains("-----BEGIN") {
                opts.api_ca.as_bytes().to_vec()
            } else {
                std::fs::read(&opts.api_ca)
                    .map_err(|e| ResolverError::Tls(format!("reading API CA: {e}")))?
            };
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| ResolverError::Tls(format!("parsing API CA: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder.build()?;

        Ok(Self {
            client,
            base_url: opts.base_url.trim_end_matches('/').to_string(),
            token: opts.token,
            check_uuid: opts.check_uuid,
            broker_tls,
            cached: RwLock::new(None),
        })
    }

    async fn fetch_bundle(&self) -> Result<Bundle> {
        let path = format!("/v1/check_bundles/{}", self.check_uuid);
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ResolverError::ApiStatus {
                status: resp.status().as_u16(),
                path,
            });
        }
        let doc: CheckBundleDoc = resp.json().await?;
        self.build_bundle(doc)
    }

    fn build_bundle(&self, doc: CheckBundleDoc) -> Result<Bundle> {
        let meta = CheckMeta {
            bundle_id: doc.bundle_id,
            check_id: doc.check_id,
            check_uuid: doc.check_uuid,
        };

        let mut configs = ReverseConfigs::new();
        for broker in doc.brokers {
            let reverse_url = ReverseUrl::parse(&broker.reverse_url)?;
            let address = broker
                .address
                .clone()
                .unwrap_or_else(|| reverse_url.address());
            if configs.contains_key(&broker.cn) {
                tracing::warn!(cn = %broker.cn, "duplicate broker CN in bundle, keeping latest");
            }
            configs.insert(
                broker.cn.clone(),
                BrokerConfig {
                    broker_id: broker.id,
                    cn: broker.cn,
                    address,
                    reverse_url,
                    tls: self.broker_tls.clone(),
                },
            );
        }

        Ok(Bundle { meta, configs })
    }
}

#[async_trait]
impl Resolver for ApiResolver {
    fn reverse_configs(&self) -> Result<ReverseConfigs> {
        let cached = self.cached.read().unwrap_or_else(|e| e.into_inner());
        match cached.as_ref() {
            Some(bundle) => Ok(bundle.configs.clone()),
            None => Err(ResolverError::NotLoaded),
        }
    }

    async fn refresh_reverse_config(&self) -> Result<()> {
        let bundle = self.fetch_bundle().await?;
        tracing::debug!(
            brokers = bundle.configs.len(),
            bundle_cid = %bundle.meta.bundle_id,
            "check bundle refreshed"
        );
        let mut cached = self.cached.write().unwrap_or_else(|e| e.into_inner());
        *cached = Some(bundle);
        Ok(())
    }

    async fn find_primary(&self, configs: &ReverseConfigs) -> Result<String> {
        tracing::debug!(candidates = configs.len(), "locating primary broker");
        let path = format!("/v1/checks/{}/owner", self.check_uuid);
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        match resp.status() {
            reqwest::StatusCode::NOT_FOUND | reqwest::StatusCode::NO_CONTENT => {
                Err(ResolverError::NoOwnerFound {
                    check_uuid: self.check_uuid.clone(),
                })
            }
            s if s.is_success() => {
                let owner: OwnerDoc = resp.json().await?;
                Ok(owner.cn)
            }
            s => Err(ResolverError::ApiStatus {
                status: s.as_u16(),
                path,
            }),
        }
    }

    fn metadata(&self) -> Result<CheckMeta> {
        let cached = self.cached.read().unwrap_or_else(|e| e.into_inner());
        match cached.as_ref() {
            Some(bundle) => Ok(bundle.meta.clone()),
            None => Err(ResolverError::NotLoaded),
        }
    }
}
