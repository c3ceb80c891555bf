//! Error taxonomy for the parts of the daemon that run before any kernel
//! request exists to hand an errno back to (config loading, config-store
//! setup). Per-operation errno bridging stays a free function next to the
//! filesystem surface; it has nothing to do with this type.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateFsError {
    #[error("failed to read daemon configuration at {path:?}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse daemon configuration at {path:?}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to read config store document at {path:?}: {source}")]
    ConfigStoreRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config store document at {path:?}: {source}")]
    ConfigStoreParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid path: {0:?}")]
    InvalidPath(PathBuf),
}
