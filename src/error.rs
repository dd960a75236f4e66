use thiserror::Error;

/// Errors surfaced by the deploy pipeline. All of them abort the operation
/// that raised them; nothing is retried automatically.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cannot resolve ref '{reference}': {detail}")]
    Resolution { reference: String, detail: String },

    #[error("git command failed: {0}")]
    Git(String),

    #[error("no manifests found for context '{0}'")]
    ManifestNotFound(String),

    #[error("unknown image '{0}' (untagged and not in the configured image list)")]
    UnknownImageReference(String),

    #[error("could not start command: {0}")]
    RemoteCommand(String),

    #[error("builder error: {0}")]
    Builder(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
