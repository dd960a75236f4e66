use crate::config::Config;
use crate::docker::Docker;
use crate::error::{Error, Result};
use crate::executor::{CommandOutput, Kubectl};
use crate::git::GitRepo;
use crate::image::Image;
use crate::manifest::{self, Manifest};
use crate::notify::{self, NotifyVars};
use crate::reconcile::{self, ManifestStatus};
use regex::Regex;
use std::collections::HashMap;
use tracing::info;

/// Drives one deploy pass: resolve → build → push → rewrite → apply →
/// notify. Ref resolution and manifest sets are memoized for the lifetime of
/// the instance.
pub struct Deployer {
    config: Config,
    repo: GitRepo,
    docker: Docker,
    kubectl: Kubectl,
    http: reqwest::Client,
    images: Vec<Image>,
    reference: Option<String>,
    commit: Option<String>,
    tag: Option<String>,
    manifests: HashMap<String, Vec<Manifest>>,
}

impl Deployer {
    pub async fn new(config: Config) -> Result<Self> {
        let repo = GitRepo::new(&config.repository);
        let docker = Docker::detect(config.build_jobs).await?;
        let kubectl = match &config.ssh_host {
            Some(host) => Kubectl::tunneled(host),
            None => Kubectl::local(),
        };
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Configuration(format!("http client: {e}")))?;
        let images = config
            .images
            .iter()
            .map(|spec| {
                Image::new(
                    &spec.name,
                    &config.repository,
                    spec.dockerfile(),
                    &config.registry,
                )
            })
            .collect();

        Ok(Self {
            config,
            repo,
            docker,
            kubectl,
            http,
            images,
            reference: None,
            commit: None,
            tag: None,
            manifests: HashMap::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Resolve `reference` to a commit and derive the artifact tag, updating
    /// every image in place. Resolving the same ref again is a no-op;
    /// resolving a different one drops the cached manifest sets.
    pub async fn set_ref(&mut self, reference: &str) -> Result<()> {
        if self.reference.as_deref() == Some(reference) && self.commit.is_some() {
            return Ok(());
        }

        let stripped = strip_short_id_marker(reference)?;
        let commit = self.repo.rev_parse(stripped).await?;
        let tag = derive_tag(&commit)?.to_string();
        info!("Resolved {} to {} (tag {})", reference, commit, tag);

        for image in &mut self.images {
            image.set_commit(&commit);
            image.set_tag(&tag);
        }
        self.manifests.clear();
        self.reference = Some(reference.to_string());
        self.commit = Some(commit);
        self.tag = Some(tag);
        Ok(())
    }

    /// Build every configured image at the resolved commit, one at a time.
    pub async fn build(&mut self) -> Result<()> {
        for image in &self.images {
            self.docker.build(image).await?;
        }
        Ok(())
    }

    /// Push every configured image, one at a time.
    pub async fn push(&mut self) -> Result<()> {
        for image in self.images.iter_mut() {
            self.docker.push(image).await?;
        }
        Ok(())
    }

    /// The manifests selected for deployment: loaded from the commit's tree,
    /// rewritten to the resolved artifacts, filtered to documents that
    /// reference a configured image.
    pub async fn deploy_manifests(&mut self, context: &str) -> Result<Vec<Manifest>> {
        self.load_manifests(context).await?;
        let documents = &self.manifests[context];
        manifest::rewrite(documents, &self.images)
    }

    /// Apply the selected manifests to `context` and announce the deploy.
    /// kubectl's verdict is returned to the caller; partially applied sets
    /// are not rolled back.
    pub async fn deploy(&mut self, context: &str) -> Result<CommandOutput> {
        let selected = self.deploy_manifests(context).await?;
        if selected.is_empty() {
            return Err(Error::ManifestNotFound(context.to_string()));
        }

        info!(
            "Applying {} manifests to context {}",
            selected.len(),
            context
        );
        let stream = manifest::to_stream(&selected)?;
        let output = self
            .kubectl
            .execute(context, ["apply", "-f", "-"], Some(&stream))
            .await?;

        self.notify(context).await;
        Ok(output)
    }

    /// Live status per selected manifest; `None` when the cluster could not
    /// be queried.
    pub async fn status(&mut self, context: &str) -> Result<Option<Vec<ManifestStatus>>> {
        let selected = self.deploy_manifests(context).await?;
        reconcile::status(&self.kubectl, context, selected).await
    }

    /// Send the context's webhook notification, if one is configured.
    pub async fn notify(&self, context: &str) {
        let Some(notify_config) = self
            .config
            .contexts
            .get(context)
            .and_then(|c| c.notify.as_ref())
        else {
            return;
        };
        let vars = NotifyVars {
            repository: self.config.repository.display().to_string(),
            registry: self.config.registry.clone(),
            ssh_host: self.config.ssh_host.clone().unwrap_or_default(),
            reference: self.reference.clone().unwrap_or_default(),
            commit: self.commit.clone().unwrap_or_default(),
            tag: self.tag.clone().unwrap_or_default(),
        };
        notify::send(&self.http, notify_config, &vars).await;
    }

    async fn load_manifests(&mut self, context: &str) -> Result<()> {
        if self.manifests.contains_key(context) {
            return Ok(());
        }
        let commit = self.commit.as_deref().ok_or_else(|| Error::Resolution {
            reference: String::new(),
            detail: "no ref resolved yet".to_string(),
        })?;
        let documents = manifest::load(&self.repo, commit, context).await?;
        self.manifests.insert(context.to_string(), documents);
        Ok(())
    }
}

/// Strip the short-id marker: `g` followed by exactly 8 hex digits names an
/// abbreviated commit id.
fn strip_short_id_marker(reference: &str) -> Result<&str> {
    let re = Regex::new(r"^g[0-9a-fA-F]{8}$")
        .map_err(|e| Error::Configuration(format!("invalid marker pattern: {e}")))?;
    if re.is_match(reference) {
        Ok(&reference[1..])
    } else {
        Ok(reference)
    }
}

/// The artifact tag is the abbreviated commit id.
fn derive_tag(commit: &str) -> Result<&str> {
    commit.get(..8).ok_or_else(|| Error::Resolution {
        reference: commit.to_string(),
        detail: "commit id too short".to_string(),
    })
}
