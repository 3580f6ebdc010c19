//! Bulk dependencies started through `docker compose`

use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// A compose project brought up before the service listeners and torn
/// down after them
#[derive(Debug, Clone)]
pub struct ComposeStack {
    file: PathBuf,
    docker_path: String,
}

impl ComposeStack {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            docker_path: "docker".to_string(),
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Arguments passed to the docker CLI for a compose subcommand
    fn args<'a>(&'a self, subcommand: &[&'a str]) -> Vec<&'a OsStr> {
        let mut args = vec![OsStr::new("compose"), OsStr::new("-f"), self.file.as_os_str()];
        args.extend(subcommand.iter().map(|s| OsStr::new(*s)));
        args
    }

    pub async fn up(&self) -> Result<()> {
        info!(file = %self.file.display(), "Starting compose services");
        self.run(&["up", "-d"]).await
    }

    pub async fn down(&self) -> Result<()> {
        info!(file = %self.file.display(), "Stopping compose services");
        self.run(&["down"]).await
    }

    async fn run(&self, subcommand: &[&str]) -> Result<()> {
        if !self.file.exists() {
            anyhow::bail!("Compose file not found: {}", self.file.display());
        }

        let output = Command::new(&self.docker_path)
            .args(self.args(subcommand))
            .output()
            .await
            .with_context(|| format!("Failed to run {} compose", self.docker_path))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "docker compose {} failed: {}",
                subcommand.join(" "),
                stderr.trim()
            );
        }

        debug!(
            file = %self.file.display(),
            command = %subcommand.join(" "),
            "Compose command finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args() {
        let stack = ComposeStack::new("deploy/docker-compose.yml");
        let args: Vec<String> = stack
            .args(&["up", "-d"])
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["compose", "-f", "deploy/docker-compose.yml", "up", "-d"]);
    }

    #[tokio::test]
    async fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let stack = ComposeStack::new(dir.path().join("missing.yml"));

        let err = stack.up().await.unwrap_err();
        assert!(err.to_string().contains("Compose file not found"));
        assert!(stack.down().await.is_err());
    }
}
