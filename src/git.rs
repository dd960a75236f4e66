use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// A git repository addressed by its on-disk path. Everything is read out of
/// the object database at an explicit commit; no working-tree checkout.
#[derive(Debug, Clone)]
pub struct GitRepo {
    path: PathBuf,
}

/// One `ls-tree` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: String,
    pub kind: String,
    pub id: String,
    pub path: String,
}

impl GitRepo {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Resolve a ref (branch, tag, full or abbreviated commit id) to the full
    /// commit id.
    pub async fn rev_parse(&self, reference: &str) -> Result<String> {
        let output = self.git(&["rev-parse", "--verify", reference]).await?;
        if !output.status.success() {
            return Err(Error::Resolution {
                reference: reference.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// List blob entries directly under `prefix` at `commit`, in path order.
    pub async fn blobs_under(&self, commit: &str, prefix: &str) -> Result<Vec<TreeEntry>> {
        let output = self.git(&["ls-tree", commit, "--", prefix]).await?;
        if !output.status.success() {
            return Err(Error::Git(format!(
                "ls-tree {} {} failed: {}",
                commit,
                prefix,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut entries = Vec::new();
        for line in stdout.lines() {
            // "<mode> <type> <id>\t<path>"
            let Some((info, path)) = line.split_once('\t') else {
                continue;
            };
            let mut fields = info.split_whitespace();
            let (Some(mode), Some(kind), Some(id)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if kind != "blob" {
                continue;
            }
            entries.push(TreeEntry {
                mode: mode.to_string(),
                kind: kind.to_string(),
                id: id.to_string(),
                path: path.to_string(),
            });
        }
        Ok(entries)
    }

    /// Fetch the raw content of `path` at `commit`.
    pub async fn show(&self, commit: &str, path: &str) -> Result<String> {
        let spec = format!("{commit}:{path}");
        let output = self.git(&["show", &spec]).await?;
        if !output.status.success() {
            return Err(Error::Git(format!(
                "show {} failed: {}",
                spec,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        String::from_utf8(output.stdout)
            .map_err(|_| Error::Git(format!("{spec} is not valid UTF-8")))
    }

    /// Export the full tree at `commit` into `dir` by piping `git archive`
    /// into `tar`.
    pub async fn export(&self, commit: &str, dir: &Path) -> Result<()> {
        debug!(
            "Exporting {} of {} into {}",
            commit,
            self.path.display(),
            dir.display()
        );

        let mut archive = Command::new("git")
            .arg("-C")
            .arg(&self.path)
            .args(["archive", "--format=tar", commit])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut tar = Command::new("tar")
            .arg("-x")
            .arg("-C")
            .arg(dir)
            .stdin(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut archive_stdout = archive
            .stdout
            .take()
            .ok_or_else(|| Error::Git("git archive stdout not captured".to_string()))?;
        let mut tar_stdin = tar
            .stdin
            .take()
            .ok_or_else(|| Error::Git("tar stdin not captured".to_string()))?;

        tokio::io::copy(&mut archive_stdout, &mut tar_stdin).await?;
        tar_stdin.shutdown().await?;
        drop(tar_stdin);

        let archive_output = archive.wait_with_output().await?;
        if !archive_output.status.success() {
            return Err(Error::Git(format!(
                "archive of {} failed: {}",
                commit,
                String::from_utf8_lossy(&archive_output.stderr).trim()
            )));
        }
        let tar_output = tar.wait_with_output().await?;
        if !tar_output.status.success() {
            return Err(Error::Git(format!(
                "tar extraction failed: {}",
                String::from_utf8_lossy(&tar_output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!("Running git {:?} in {}", args, self.path.display());
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.path)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok(output)
    }
}
