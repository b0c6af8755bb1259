use thiserror::Error;

use super::backend::BackendError;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("failed to serialize entry for `{key}`: {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to deserialize entry at `{key}`: {source}")]
    Deserialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CacheError {
    pub fn serialize(key: &str, source: serde_json::Error) -> Self {
        Self::Serialize {
            key: key.to_string(),
            source,
        }
    }

    pub fn deserialize(key: &str, source: serde_json::Error) -> Self {
        Self::Deserialize {
            key: key.to_string(),
            source,
        }
    }
}
