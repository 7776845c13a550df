use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};

use secrecy::{ExposeSecret, SecretString};

use crate::config::{Config, ProviderCfg};
use crate::error::{CoreResult, TagStreamError};
use crate::http_client::HttpClient;
use crate::providers::OpenAiCompatible;

/// Cache key: provider name, endpoint, and a fingerprint of the API key so
/// the key itself never sits in the map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    provider: String,
    base_url: String,
    key_fingerprint: Option<u64>,
}

/// Provider clients by name. Owned by whoever builds the workers; there is
/// no process-wide instance.
pub struct ClientRegistry {
    http: HttpClient,
    reasoning_tag: String,
    clients: Mutex<HashMap<ClientKey, Arc<OpenAiCompatible>>>,
}

impl ClientRegistry {
    pub fn new(http: HttpClient) -> Self {
        Self {
            http,
            reasoning_tag: "think".into(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &Config) -> CoreResult<Self> {
        let mut reg = Self::new(HttpClient::from_cfg(&cfg.http)?);
        reg.reasoning_tag = cfg.tags.reasoning.clone();
        Ok(reg)
    }

    /// Client for `name`, reading its API key from the configured
    /// environment variable.
    pub fn get_or_create(&self, name: &str, cfg: &ProviderCfg) -> CoreResult<Arc<OpenAiCompatible>> {
        let api_key = resolve_api_key(name, cfg)?;
        self.get_or_create_with_key(name, cfg, api_key)
    }

    /// Same as [`get_or_create`](Self::get_or_create) with an explicit key.
    pub fn get_or_create_with_key(
        &self,
        name: &str,
        cfg: &ProviderCfg,
        api_key: Option<SecretString>,
    ) -> CoreResult<Arc<OpenAiCompatible>> {
        if cfg.base_url.trim().is_empty() {
            return Err(TagStreamError::Validation(format!(
                "provider '{name}' has an empty base_url"
            )));
        }
        let key = ClientKey {
            provider: name.to_string(),
            base_url: cfg.base_url.clone(),
            key_fingerprint: api_key.as_ref().map(fingerprint),
        };
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(c) = clients.get(&key) {
            return Ok(c.clone());
        }
        tracing::debug!(provider = name, base_url = %cfg.base_url, "creating provider client");
        let client = Arc::new(
            OpenAiCompatible::new(name, self.http.clone(), cfg.base_url.clone(), api_key)
                .with_reasoning_tag(self.reasoning_tag.clone()),
        );
        clients.insert(key, client.clone());
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached client; returns how many were dropped. Streams
    /// already opened keep their own handles.
    pub fn close_all(&self) -> usize {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        let n = clients.len();
        clients.clear();
        n
    }
}

fn fingerprint(key: &SecretString) -> u64 {
    let mut h = DefaultHasher::new();
    key.expose_secret().hash(&mut h);
    h.finish()
}

fn resolve_api_key(name: &str, cfg: &ProviderCfg) -> CoreResult<Option<SecretString>> {
    let Some(var) = &cfg.api_key_env else {
        return Ok(None);
    };
    match std::env::var(var) {
        Ok(v) if !v.trim().is_empty() => Ok(Some(SecretString::from(v))),
        _ => Err(TagStreamError::Validation(format!(
            "provider '{name}' expects an API key in ${var}"
        ))),
    }
}
