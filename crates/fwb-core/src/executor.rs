use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{BuildError, BuildFailure};
use crate::hashing::packages_digest;
use crate::imagebuilder::{ImageParams, ManifestParams, ToolchainCommand};
use crate::request::NormalizedRequest;
use crate::singleflight::SingleFlight;
use crate::toolchain::{Toolchain, ToolchainKey, ToolchainSource};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const BUILD_LOG_FILE: &str = "buildlog.txt";
const DESCRIPTOR_PREFIX: &str = "openwrt-";
const DESCRIPTOR_SUFFIX: &str = ".json";

/// Outcome of a successful build, stored under `<store>/<relative_dir>`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifact {
    pub packages_key: String,
    /// Resolved package name to version.
    pub manifest: BTreeMap<String, String>,
    pub relative_dir: String,
    pub dir: PathBuf,
    pub descriptor: PathBuf,
    pub build_log: PathBuf,
}

/// The unit of work a job worker runs.
#[async_trait]
pub trait BuildRunner: Send + Sync {
    async fn run(&self, request: &NormalizedRequest) -> Result<BuildArtifact, BuildFailure>;
}

/// Parses `name - version` lines. Blank lines are skipped; anything else fails.
pub fn parse_manifest(stdout: &str) -> Result<BTreeMap<String, String>, BuildError> {
    let mut manifest = BTreeMap::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some((name, version)) = line.split_once(" - ") else {
            return Err(BuildError::ManifestResolution(format!(
                "unexpected manifest line {line:?}"
            )));
        };
        let (name, version) = (name.trim(), version.trim());
        if name.is_empty() || version.is_empty() || name.contains(char::is_whitespace) {
            return Err(BuildError::ManifestResolution(format!(
                "unexpected manifest line {line:?}"
            )));
        }
        manifest.insert(name.to_string(), version.to_string());
    }
    if manifest.is_empty() {
        return Err(BuildError::ManifestResolution(
            "manifest resolution produced no packages".into(),
        ));
    }
    Ok(manifest)
}

/// Store slot relative to the store root: `<version>/<target>/<subtarget>/<profile>/<key>`.
pub fn slot_path(request: &NormalizedRequest, packages_key: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        request.version, request.target, request.profile, packages_key
    )
}

/// All `openwrt-*.json` files in `dir`, in name order.
fn descriptors(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut matches: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with(DESCRIPTOR_PREFIX) && name.ends_with(DESCRIPTOR_SUFFIX)
        })
        .map(|entry| entry.path())
        .collect();
    matches.sort();
    matches
}

/// First `openwrt-*.json` in name order.
pub(crate) fn find_descriptor(dir: &Path) -> Option<PathBuf> {
    descriptors(dir).into_iter().next()
}

fn store_error(path: &Path, err: impl ToString) -> BuildFailure {
    BuildError::ImageBuild(format!(
        "failed to write {}: {}",
        path.display(),
        err.to_string()
    ))
    .into()
}

/// Two-phase build against a bootstrapped toolchain into the content-addressed store.
#[derive(Clone)]
pub struct BuildExecutor {
    store_dir: PathBuf,
    toolchains: Arc<dyn ToolchainSource>,
    command: Arc<dyn ToolchainCommand>,
    slots: Arc<SingleFlight<Result<BuildArtifact, BuildFailure>>>,
}

impl BuildExecutor {
    pub fn new(
        store_dir: PathBuf,
        toolchains: Arc<dyn ToolchainSource>,
        command: Arc<dyn ToolchainCommand>,
    ) -> Self {
        Self {
            store_dir,
            toolchains,
            command,
            slots: Arc::new(SingleFlight::new()),
        }
    }

    async fn build_into(
        &self,
        toolchain: Toolchain,
        request: NormalizedRequest,
        manifest: BTreeMap<String, String>,
        packages_key: String,
        relative_dir: String,
    ) -> Result<BuildArtifact, BuildFailure> {
        let dir = self.store_dir.join(&relative_dir);
        fs::create_dir_all(&dir).map_err(|e| store_error(&dir, e))?;
        let manifest_path = dir.join(MANIFEST_FILE);
        fwb_util::write_json_atomic(&manifest_path, &manifest)
            .map_err(|e| store_error(&manifest_path, e))?;
        // A rebuild into the same slot must produce its own descriptor.
        for stale in descriptors(&dir) {
            fs::remove_file(&stale).map_err(|e| store_error(&stale, e))?;
        }

        let params = ImageParams {
            profile: request.profile.clone(),
            packages: request.packages.iter().cloned().collect(),
            diff_packages: request.diff_packages,
            bin_dir: dir.clone(),
            extra_name: packages_key.clone(),
        };
        let output = self.command.build_image(&toolchain, &params).await?;

        let build_log = dir.join(BUILD_LOG_FILE);
        fs::write(&build_log, output.build_log()).map_err(|e| store_error(&build_log, e))?;

        if !output.success() {
            warn!(
                "Image build for {} failed with exit code {}",
                relative_dir, output.exit_code
            );
            return Err(BuildError::ImageBuild(output.error_text()).into());
        }

        let descriptor = find_descriptor(&dir).ok_or_else(|| {
            BuildError::ImageBuild(format!(
                "no image descriptor ({DESCRIPTOR_PREFIX}*{DESCRIPTOR_SUFFIX}) in {}",
                dir.display()
            ))
        })?;
        info!("Built {relative_dir}");
        Ok(BuildArtifact {
            packages_key,
            manifest,
            relative_dir,
            dir,
            descriptor,
            build_log,
        })
    }
}

#[async_trait]
impl BuildRunner for BuildExecutor {
    async fn run(&self, request: &NormalizedRequest) -> Result<BuildArtifact, BuildFailure> {
        let key = ToolchainKey::new(&request.version, request.target.clone());
        let toolchain = self.toolchains.ensure(&key).await?;

        let params = ManifestParams {
            profile: request.profile.clone(),
            packages: request.packages.iter().cloned().collect(),
            diff_packages: request.diff_packages,
        };
        let output = self.command.resolve_manifest(&toolchain, &params).await?;
        if !output.success() {
            warn!(
                "Manifest resolution for {} failed with exit code {}",
                request.profile, output.exit_code
            );
            return Err(BuildError::ManifestResolution(output.error_text()).into());
        }
        let manifest = parse_manifest(&output.stdout)?;
        let packages_key = packages_digest(manifest.keys());
        let relative_dir = slot_path(request, &packages_key);
        info!(
            "Resolved {} packages for {}, packages key {}",
            manifest.len(),
            request.profile,
            packages_key
        );

        let this = self.clone();
        let request = request.clone();
        let slot = relative_dir.clone();
        self.slots
            .run(&slot, move || async move {
                this.build_into(toolchain, request, manifest, packages_key, relative_dir)
                    .await
            })
            .await
    }
}
