use crate::error::{Error, Result};
use crate::git::GitRepo;
use crate::image::Image;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// How a local artifact gets to the registry. Picked once from the detected
/// executable and injected; never re-derived per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStrategy {
    /// podman pushes a local tag straight to a remote destination.
    WithDestination,
    /// docker needs a remote-named alias: tag, push, then untag.
    TagAndPush,
}

/// The container engine collaborator, `docker` or `podman`.
#[derive(Debug, Clone)]
pub struct Docker {
    program: String,
    strategy: PushStrategy,
    build_jobs: usize,
}

impl Docker {
    /// Probe PATH for `docker`, then `podman`. The push strategy follows the
    /// engine that actually answers; a `docker` shim backed by podman is
    /// detected through its version banner.
    pub async fn detect(build_jobs: usize) -> Result<Self> {
        for candidate in ["docker", "podman"] {
            let probe = Command::new(candidate)
                .arg("--version")
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .output()
                .await;
            let Ok(output) = probe else { continue };
            if !output.status.success() {
                continue;
            }
            let banner = String::from_utf8_lossy(&output.stdout).to_lowercase();
            let strategy = if candidate == "podman" || banner.contains("podman") {
                PushStrategy::WithDestination
            } else {
                PushStrategy::TagAndPush
            };
            info!("Using container engine {} ({:?})", candidate, strategy);
            return Ok(Self {
                program: candidate.to_string(),
                strategy,
                build_jobs,
            });
        }
        Err(Error::Builder(
            "neither docker nor podman found on PATH".to_string(),
        ))
    }

    /// Construct with an explicit program and strategy.
    pub fn with_program(program: &str, strategy: PushStrategy, build_jobs: usize) -> Self {
        Self {
            program: program.to_string(),
            strategy,
            build_jobs,
        }
    }

    /// Does the local image store already hold this artifact?
    pub async fn image_exists(&self, local_image: &str) -> Result<bool> {
        let output = Command::new(&self.program)
            .args(["image", "inspect", local_image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await?;
        Ok(output.status.success())
    }

    /// Build `image` at its resolved commit, unless the local artifact
    /// already exists. The commit's tree is exported into a scoped temporary
    /// directory which is removed on every exit path.
    pub async fn build(&self, image: &Image) -> Result<()> {
        let local_image = resolved(image.local_image(), image)?;
        let commit = resolved(image.commit().map(String::from), image)?;

        if self.image_exists(&local_image).await? {
            info!("Image {} already built, skipping", local_image);
            return Ok(());
        }

        let build_dir = tempfile::Builder::new()
            .prefix(&format!("{}-build-", image.name()))
            .tempdir()?;
        GitRepo::new(image.repository())
            .export(&commit, build_dir.path())
            .await?;

        info!("Building {} from {}", local_image, commit);
        // run inside the exported tree so the dockerfile is the committed one
        let status = Command::new(&self.program)
            .current_dir(build_dir.path())
            .args(["build", "-f", image.dockerfile(), "-t", &local_image])
            .arg(format!("--build-arg=JOBS={}", self.build_jobs))
            .arg(format!("--build-arg=GIT_VERSION={commit}"))
            .arg(".")
            .status()
            .await?;
        if !status.success() {
            return Err(Error::Builder(format!(
                "build of {local_image} failed ({status})"
            )));
        }
        Ok(())
    }

    /// Does the registry already hold this artifact? Probes once per tag and
    /// memoizes the answer on the image.
    pub async fn remote_exists(&self, image: &mut Image) -> Result<bool> {
        if let Some(known) = image.remote_exists_memo() {
            return Ok(known);
        }
        let remote_image = resolved(image.remote_image(), image)?;

        let output = Command::new(&self.program)
            .env("DOCKER_CLI_EXPERIMENTAL", "enabled")
            .args(["manifest", "inspect", &remote_image])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exists = manifest_probe_exists(output.status.success(), &stderr);
        if !exists && !benign_probe_noise(&stderr) {
            warn!("{}", stderr.trim());
        }

        image.set_remote_exists(exists);
        Ok(exists)
    }

    /// Push `image` to the registry, unless the remote artifact already
    /// exists.
    pub async fn push(&self, image: &mut Image) -> Result<()> {
        if self.remote_exists(image).await? {
            info!(
                "Image {} already in the registry, skipping",
                resolved(image.remote_image(), image)?
            );
            return Ok(());
        }
        let local_image = resolved(image.local_image(), image)?;
        let remote_image = resolved(image.remote_image(), image)?;

        info!("Pushing {}", remote_image);
        match self.strategy {
            PushStrategy::WithDestination => {
                self.run_streaming(&["push", &local_image, &remote_image])
                    .await?;
            }
            PushStrategy::TagAndPush => {
                self.run_streaming(&["tag", &local_image, &remote_image])
                    .await?;
                self.run_streaming(&["push", &remote_image]).await?;
                self.run_streaming(&["rmi", &remote_image]).await?;
            }
        }
        image.set_remote_exists(true);
        Ok(())
    }

    /// Run with inherited stdio so build/push progress reaches the terminal.
    async fn run_streaming(&self, args: &[&str]) -> Result<()> {
        debug!("Running {} {:?}", self.program, args);
        let status = Command::new(&self.program).args(args).status().await?;
        if !status.success() {
            return Err(Error::Builder(format!(
                "{} {} failed ({status})",
                self.program,
                args.join(" ")
            )));
        }
        Ok(())
    }
}

/// `manifest inspect` classification. A clean exit means the manifest is
/// there; so does the known parse failure on manifests produced by some
/// builders, which only occurs when a blob was actually fetched.
fn manifest_probe_exists(success: bool, stderr: &str) -> bool {
    success || stderr.contains("error parsing manifest blob")
}

/// stderr responses that just mean "not in the registry yet".
fn benign_probe_noise(stderr: &str) -> bool {
    let stderr = stderr.trim();
    stderr.is_empty()
        || stderr.contains("manifest unknown")
        || stderr.contains("no such manifest")
}

fn resolved<T>(value: Option<T>, image: &Image) -> Result<T> {
    value.ok_or_else(|| Error::Resolution {
        reference: image.name().to_string(),
        detail: "image has no resolved commit/tag".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_exit_means_exists() {
        assert!(manifest_probe_exists(true, ""));
    }

    #[test]
    fn allow_listed_parse_failure_means_exists() {
        let stderr = "error parsing manifest blob \"sha256:abc\": invalid character";
        assert!(manifest_probe_exists(false, stderr));
    }

    #[test]
    fn unknown_manifest_means_absent() {
        let stderr = "manifest unknown: manifest unknown";
        assert!(!manifest_probe_exists(false, stderr));
        assert!(benign_probe_noise(stderr));
    }

    #[test]
    fn other_probe_failures_are_absent_but_noisy() {
        let stderr = "unauthorized: authentication required";
        assert!(!manifest_probe_exists(false, stderr));
        assert!(!benign_probe_noise(stderr));
    }

    #[tokio::test]
    async fn missing_engine_surfaces_an_error() {
        let docker = Docker::with_program("definitely-not-an-engine", PushStrategy::TagAndPush, 1);
        assert!(docker.image_exists("svc:abc12345").await.is_err());
    }
}
