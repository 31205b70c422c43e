use crate::error::{ResolverError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Identity of the check this agent reports under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckMeta {
    pub bundle_id: String,
    pub check_id: String,
    pub check_uuid: String,
}

/// The reverse endpoint a broker exposes, e.g.
/// `mtev_reverse://203.0.113.10:43191/check/<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseUrl {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

pub const DEFAULT_REVERSE_PORT: u16 = 43191;

impl ReverseUrl {
    pub fn parse(input: &str) -> Result<Self> {
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| ResolverError::InvalidBroker(format!("reverse url '{input}'")))?;
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    ResolverError::InvalidBroker(format!("reverse url port in '{input}'"))
                })?;
                (host, port)
            }
            None => (authority, DEFAULT_REVERSE_PORT),
        };
        if host.is_empty() {
            return Err(ResolverError::InvalidBroker(format!(
                "reverse url host in '{input}'"
            )));
        }
        Ok(Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    /// `host:port` dial target.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ReverseUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}{}",
            self.scheme, self.host, self.port, self.path
        )
    }
}

/// One broker this check may connect to. Built by the resolver, replaced
/// wholesale on refresh, never mutated.
#[derive(Clone)]
pub struct BrokerConfig {
    pub broker_id: String,
    /// Canonical name the broker's certificate must present.
    pub cn: String,
    /// Resolved `host:port` dial target.
    pub address: String,
    pub reverse_url: ReverseUrl,
    /// Client TLS material rooted at the broker CA.
    pub tls: Arc<rustls::ClientConfig>,
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("broker_id", &self.broker_id)
            .field("cn", &self.cn)
            .field("address", &self.address)
            .field("reverse_url", &self.reverse_url)
            .finish_non_exhaustive()
    }
}

/// Broker CN to config, keys unique. Lifetime: one supervisor cycle, until
/// a refresh replaces the whole map.
pub type ReverseConfigs = HashMap<String, BrokerConfig>;
