//! The seam between the executor and the external image builder.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::BuildError;
use crate::toolchain::Toolchain;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestParams {
    pub profile: String,
    /// Selector strings; a leading `-` removes a default package.
    pub packages: Vec<String>,
    pub diff_packages: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageParams {
    pub profile: String,
    pub packages: Vec<String>,
    pub diff_packages: bool,
    pub bin_dir: PathBuf,
    /// Suffix the builder appends to generated image names.
    pub extra_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The captured stream most likely to explain a failure.
    pub fn error_text(&self) -> String {
        if !self.stderr.trim().is_empty() {
            self.stderr.trim_end().to_string()
        } else if !self.stdout.trim().is_empty() {
            self.stdout.trim_end().to_string()
        } else {
            format!("exited with code {}", self.exit_code)
        }
    }

    pub fn build_log(&self) -> String {
        format!(
            "### STDOUT\n\n{}\n\n### STDERR\n\n{}",
            self.stdout, self.stderr
        )
    }
}

#[async_trait]
pub trait ToolchainCommand: Send + Sync {
    /// Resolves the requested selectors into `name - version` lines on stdout.
    async fn resolve_manifest(
        &self,
        toolchain: &Toolchain,
        params: &ManifestParams,
    ) -> Result<CommandOutput, BuildError>;

    /// Writes images and an `openwrt-*.json` descriptor into `params.bin_dir`.
    async fn build_image(
        &self,
        toolchain: &Toolchain,
        params: &ImageParams,
    ) -> Result<CommandOutput, BuildError>;
}

/// Drives an OpenWrt ImageBuilder tree through its Makefile.
#[derive(Clone, Debug)]
pub struct MakeImageBuilder {
    make: String,
}

impl MakeImageBuilder {
    pub fn new(make: &str) -> Self {
        Self {
            make: make.to_string(),
        }
    }

    async fn make(&self, dir: &Path, args: &[String]) -> std::io::Result<CommandOutput> {
        debug!("{} {} in {}", self.make, args.join(" "), dir.display());
        let output = Command::new(&self.make)
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// With `diff_packages` set, adds removals for every default not requested.
    async fn selectors(
        &self,
        toolchain: &Toolchain,
        profile: &str,
        packages: &[String],
        diff_packages: bool,
    ) -> std::io::Result<Vec<String>> {
        if !diff_packages {
            return Ok(packages.to_vec());
        }
        let info = self.make(&toolchain.dir, &["info".to_string()]).await?;
        if !info.success() {
            return Err(std::io::Error::other(format!(
                "make info failed: {}",
                info.error_text()
            )));
        }
        let defaults = default_packages(&info.stdout, profile);
        Ok(diff_selectors(packages, &defaults))
    }
}

#[async_trait]
impl ToolchainCommand for MakeImageBuilder {
    async fn resolve_manifest(
        &self,
        toolchain: &Toolchain,
        params: &ManifestParams,
    ) -> Result<CommandOutput, BuildError> {
        let packages = self
            .selectors(toolchain, &params.profile, &params.packages, params.diff_packages)
            .await
            .map_err(|e| BuildError::ManifestResolution(e.to_string()))?;
        let args = vec![
            "manifest".to_string(),
            format!("PROFILE={}", params.profile),
            format!("PACKAGES={}", packages.join(" ")),
        ];
        info!("Resolving manifest for profile {}", params.profile);
        let output = self
            .make(&toolchain.dir, &args)
            .await
            .map_err(|e| BuildError::ManifestResolution(format!("failed to run {}: {e}", self.make)))?;
        info!("make manifest exited with {}", output.exit_code);
        Ok(output)
    }

    async fn build_image(
        &self,
        toolchain: &Toolchain,
        params: &ImageParams,
    ) -> Result<CommandOutput, BuildError> {
        let packages = self
            .selectors(toolchain, &params.profile, &params.packages, params.diff_packages)
            .await
            .map_err(|e| BuildError::ImageBuild(e.to_string()))?;
        let args = vec![
            "image".to_string(),
            format!("PROFILE={}", params.profile),
            format!("PACKAGES={}", packages.join(" ")),
            format!("EXTRA_IMAGE_NAME={}", params.extra_name),
            format!("BIN_DIR={}", params.bin_dir.display()),
        ];
        info!(
            "Building image for profile {} into {}",
            params.profile,
            params.bin_dir.display()
        );
        let output = self
            .make(&toolchain.dir, &args)
            .await
            .map_err(|e| BuildError::ImageBuild(format!("failed to run {}: {e}", self.make)))?;
        info!("make image exited with {}", output.exit_code);
        Ok(output)
    }
}

/// Default packages of the target plus those of `profile`, as reported by `make info`.
pub(crate) fn default_packages(info: &str, profile: &str) -> BTreeSet<String> {
    let mut packages = BTreeSet::new();
    let mut in_profile = false;

    for line in info.lines() {
        if let Some(rest) = line.strip_prefix("Default Packages:") {
            packages.extend(rest.split_whitespace().map(str::to_string));
            continue;
        }
        if !line.starts_with(char::is_whitespace) {
            in_profile = line.trim_end().strip_suffix(':') == Some(profile);
            continue;
        }
        if !in_profile {
            continue;
        }
        if let Some(rest) = line.trim_start().strip_prefix("Packages:") {
            for name in rest.split_whitespace() {
                match name.strip_prefix('-') {
                    Some(removed) => {
                        packages.remove(removed);
                    }
                    None => {
                        packages.insert(name.to_string());
                    }
                }
            }
        }
    }
    packages
}

pub(crate) fn diff_selectors(requested: &[String], defaults: &BTreeSet<String>) -> Vec<String> {
    let wanted: BTreeSet<&str> = requested
        .iter()
        .map(|p| p.strip_prefix('-').unwrap_or(p.as_str()))
        .collect();
    let mut selectors = requested.to_vec();
    selectors.extend(
        defaults
            .iter()
            .filter(|name| !wanted.contains(name.as_str()))
            .map(|name| format!("-{name}")),
    );
    selectors
}
