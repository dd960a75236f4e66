use std::fmt;
use std::path::{Path, PathBuf};

/// A buildable container image described by the configuration.
///
/// Commit and tag are assigned once per ref resolution; everything else is
/// fixed at load time. Local coordinates (`name:tag`) address the build
/// host's image store, remote coordinates (`registry/name:tag`) address the
/// registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    name: String,
    repository: PathBuf,
    dockerfile: String,
    registry: String,
    commit: Option<String>,
    tag: Option<String>,
    remote_exists: Option<bool>,
}

impl Image {
    pub fn new(name: &str, repository: &Path, dockerfile: &str, registry: &str) -> Self {
        Self {
            name: name.to_lowercase(),
            repository: repository.to_path_buf(),
            dockerfile: dockerfile.to_string(),
            registry: registry.to_string(),
            commit: None,
            tag: None,
            remote_exists: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn repository(&self) -> &Path {
        &self.repository
    }

    pub fn dockerfile(&self) -> &str {
        &self.dockerfile
    }

    pub fn commit(&self) -> Option<&str> {
        self.commit.as_deref()
    }

    pub fn set_commit(&mut self, commit: &str) {
        self.commit = Some(commit.to_string());
    }

    /// Assigning a new tag invalidates the remote existence memo.
    pub fn set_tag(&mut self, tag: &str) {
        self.tag = Some(tag.to_string());
        self.remote_exists = None;
    }

    pub fn remote_exists_memo(&self) -> Option<bool> {
        self.remote_exists
    }

    pub fn set_remote_exists(&mut self, exists: bool) {
        self.remote_exists = Some(exists);
    }

    pub fn remote_repo(&self) -> String {
        format!("{}/{}", self.registry, self.name)
    }

    /// `name:tag`, available once a ref has been resolved.
    pub fn local_image(&self) -> Option<String> {
        let tag = self.tag.as_deref()?;
        Some(format!("{}:{}", self.name, tag))
    }

    /// `registry/name:tag`, available once a ref has been resolved.
    pub fn remote_image(&self) -> Option<String> {
        let tag = self.tag.as_deref()?;
        Some(format!("{}/{}:{}", self.registry, self.name, tag))
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn image() -> Image {
        Image::new("Svc", Path::new("/repo"), "Dockerfile", "registry.example.com/apps")
    }

    #[test]
    fn name_is_lowercased() {
        assert_eq!(image().name(), "svc");
    }

    #[test]
    fn coordinates_require_resolution() {
        let img = image();
        assert_eq!(img.local_image(), None);
        assert_eq!(img.remote_image(), None);
        assert_eq!(img.remote_repo(), "registry.example.com/apps/svc");
    }

    #[test]
    fn coordinates_after_resolution() {
        let mut img = image();
        img.set_commit("abc12345deadbeef");
        img.set_tag("abc12345");
        assert_eq!(img.local_image().as_deref(), Some("svc:abc12345"));
        assert_eq!(
            img.remote_image().as_deref(),
            Some("registry.example.com/apps/svc:abc12345")
        );
    }

    #[test]
    fn new_tag_clears_remote_memo() {
        let mut img = image();
        img.set_tag("abc12345");
        img.set_remote_exists(true);
        assert_eq!(img.remote_exists_memo(), Some(true));
        img.set_tag("deadbeef");
        assert_eq!(img.remote_exists_memo(), None);
    }
}
