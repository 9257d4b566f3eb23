use serde::Deserialize;

/// Selects and configures the backend a [`crate::kv_store::KvStore`] is
/// built over. Mirrors the shape of `reqpool`'s pool config: a URL, a
/// feature switch, and nothing else — backend-specific tuning belongs in
/// the backend module, not here.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// `redis://host:port` when `backend` is `Redis`; ignored otherwise.
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default)]
    pub backend: StoreBackend,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

impl StoreConfig {
    pub fn memory() -> Self {
        StoreConfig { redis_url: None, backend: StoreBackend::Memory }
    }

    pub fn redis(url: impl Into<String>) -> Self {
        StoreConfig { redis_url: Some(url.into()), backend: StoreBackend::Redis }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_memory() {
        assert_eq!(StoreConfig::default().backend, StoreBackend::Memory);
    }

    #[test]
    fn deserializes_from_json() {
        let cfg: StoreConfig =
            serde_json::from_str(r#"{"backend":"redis","redis_url":"redis://localhost:6379"}"#)
                .unwrap();
        assert_eq!(cfg.backend, StoreBackend::Redis);
        assert_eq!(cfg.redis_url.as_deref(), Some("redis://localhost:6379"));
    }
}
