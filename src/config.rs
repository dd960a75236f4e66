use crate::error::{Error, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::{env, fs};
use tracing::info;

/// Candidate config locations, probed in order under the working root.
const CONFIG_LOCATIONS: [&str; 3] = [
    ".kube-shipper.yaml",
    "platform/kube-shipper.yaml",
    "config/kube-shipper.yaml",
];

const DEFAULT_BRANCH: &str = "master";
const DEFAULT_CONTEXT: &str = "staging";
const PRODUCTION_CONTEXT: &str = "production";
const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// Resolved configuration, immutable after load.
#[derive(Debug, Clone)]
pub struct Config {
    pub repository: PathBuf,
    pub registry: String,
    pub default_branch: String,
    pub default_context: String,
    pub production_context: String,
    pub ssh_host: Option<String>,
    pub build_jobs: usize,
    pub images: Vec<ImageSpec>,
    pub contexts: BTreeMap<String, ContextConfig>,
}

/// An image descriptor from the `images` list.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageSpec {
    pub name: String,
    #[serde(default)]
    pub dockerfile: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ContextConfig {
    #[serde(default)]
    pub notify: Option<NotifyConfig>,
}

/// Webhook notification descriptor for one context. Any field other than
/// `url` and `text` is carried verbatim into the delivered payload.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    pub url: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, serde_yaml_ng::Value>,
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    repository: Option<PathBuf>,
    #[serde(default)]
    registry: Option<String>,
    #[serde(default)]
    default_branch: Option<String>,
    #[serde(default)]
    default_context: Option<String>,
    #[serde(default)]
    production_context: Option<String>,
    #[serde(default)]
    ssh: Option<String>,
    #[serde(default)]
    build_jobs: Option<usize>,
    #[serde(default)]
    images: Vec<ImageSpec>,
    #[serde(default)]
    contexts: BTreeMap<String, ContextConfig>,
}

/// Load configuration from `root`, which is either a directory containing one
/// of the candidate locations or a config file itself.
pub fn load<P: AsRef<Path>>(root: P) -> Result<Config> {
    let root = root.as_ref();
    let raw: RawConfig = match find(root) {
        Some(path) => {
            info!("Loading config from file {}", path.display());
            let yaml_str = fs::read_to_string(&path)?;
            let expanded = expand_env_vars(&yaml_str)?;
            serde_yaml_ng::from_str(&expanded)?
        }
        None => RawConfig::default(),
    };

    let root_dir = if root.is_dir() {
        root.to_path_buf()
    } else {
        root.parent().unwrap_or(Path::new(".")).to_path_buf()
    };
    let repository = raw.repository.unwrap_or(root_dir);

    let registry = raw
        .registry
        .ok_or_else(|| Error::Configuration("missing 'registry'".to_string()))?;

    let images = if raw.images.is_empty() {
        vec![ImageSpec {
            name: repository_basename(&repository)?,
            dockerfile: None,
        }]
    } else {
        raw.images
    };

    Ok(Config {
        repository,
        registry,
        default_branch: raw
            .default_branch
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
        default_context: raw
            .default_context
            .unwrap_or_else(|| DEFAULT_CONTEXT.to_string()),
        production_context: raw
            .production_context
            .unwrap_or_else(|| PRODUCTION_CONTEXT.to_string()),
        ssh_host: raw.ssh,
        build_jobs: raw.build_jobs.unwrap_or_else(default_build_jobs),
        images,
        contexts: raw.contexts,
    })
}

impl ImageSpec {
    pub fn dockerfile(&self) -> &str {
        self.dockerfile.as_deref().unwrap_or(DEFAULT_DOCKERFILE)
    }
}

fn find(root: &Path) -> Option<PathBuf> {
    if !root.is_dir() {
        return Some(root.to_path_buf());
    }
    CONFIG_LOCATIONS
        .iter()
        .map(|location| root.join(location))
        .find(|path| path.exists())
}

/// One less than the number of logical cores, at least 1. Resolved once at
/// load and passed down as the builder's JOBS hint.
fn default_build_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

fn repository_basename(repository: &Path) -> Result<String> {
    let absolute = std::path::absolute(repository)?;
    let name = absolute
        .file_name()
        .ok_or_else(|| {
            Error::Configuration(format!(
                "cannot derive an image name from repository path {}",
                repository.display()
            ))
        })?
        .to_string_lossy()
        .into_owned();
    Ok(name)
}

/// Replaces `${VAR}` placeholders with environment variable values.
/// Returns an error if any referenced variable is missing.
fn expand_env_vars(input: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([^}]+)}")
        .map_err(|e| Error::Configuration(format!("invalid env var pattern: {e}")))?;

    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| var_name.to_string());
            String::new()
        })
    });

    match missing {
        Some(name) => Err(Error::Configuration(format!(
            "missing environment variable: {name}"
        ))),
        None => Ok(result.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_expand_env_vars_success() {
        unsafe {
            env::set_var("SHIPPER_TEST_VAR", "value123");
        }
        let input = "This is a test: ${SHIPPER_TEST_VAR}";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, "This is a test: value123");
        unsafe {
            env::remove_var("SHIPPER_TEST_VAR");
        }
    }

    #[test]
    fn test_expand_env_vars_missing_var() {
        let input = "This will fail: ${SHIPPER_MISSING_VAR}";
        let err = expand_env_vars(input).unwrap_err();
        assert!(err.to_string().contains("SHIPPER_MISSING_VAR"));
    }

    #[test]
    fn test_expand_env_vars_no_vars() {
        let input = "No variables here";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, input);
    }

    #[test]
    fn test_load_full_config() {
        let yaml_content = r##"
repository: /srv/checkout
registry: registry.example.com/apps
default_branch: main
ssh: deploy@bastion
build_jobs: 4
images:
  - name: api
  - name: worker
    dockerfile: worker/Dockerfile
contexts:
  staging:
    notify:
      url: https://hooks.example.com/T000/B000
      text: "deployed {{tag}}"
      channel: "#deploys"
  qa: {}
"##;

        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join(".kube-shipper.yaml");
        fs::write(&path, yaml_content).expect("Failed to write config");

        let config = load(dir.path()).expect("Should load config");

        assert_eq!(config.repository, PathBuf::from("/srv/checkout"));
        assert_eq!(config.registry, "registry.example.com/apps");
        assert_eq!(config.default_branch, "main");
        assert_eq!(config.default_context, "staging");
        assert_eq!(config.production_context, "production");
        assert_eq!(config.ssh_host.as_deref(), Some("deploy@bastion"));
        assert_eq!(config.build_jobs, 4);

        assert_eq!(config.images.len(), 2);
        assert_eq!(config.images[0].name, "api");
        assert_eq!(config.images[0].dockerfile(), "Dockerfile");
        assert_eq!(config.images[1].dockerfile(), "worker/Dockerfile");

        let notify = config.contexts["staging"].notify.as_ref().expect("notify");
        assert_eq!(notify.url, "https://hooks.example.com/T000/B000");
        assert_eq!(notify.text.as_deref(), Some("deployed {{tag}}"));
        assert_eq!(
            notify.fields["channel"],
            serde_yaml_ng::Value::String("#deploys".to_string())
        );

        // a context without a notification descriptor is fine
        assert!(config.contexts["qa"].notify.is_none());
    }

    #[test]
    fn test_load_defaults_single_image() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        fs::write(
            dir.path().join(".kube-shipper.yaml"),
            "registry: registry.example.com/apps\n",
        )
        .expect("Failed to write config");

        let config = load(dir.path()).expect("Should load config");
        assert_eq!(config.repository, dir.path());
        assert_eq!(config.images.len(), 1);
        let dirname = dir
            .path()
            .file_name()
            .expect("tempdir has a name")
            .to_string_lossy()
            .into_owned();
        assert_eq!(config.images[0].name, dirname);
        assert!(config.build_jobs >= 1);
    }

    #[test]
    fn test_missing_registry_is_an_error() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        fs::write(dir.path().join(".kube-shipper.yaml"), "images: []\n")
            .expect("Failed to write config");

        let err = load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("registry"));
    }
}
