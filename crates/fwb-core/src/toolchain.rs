use std::{
    collections::HashMap,
    fmt, fs,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex},
    time::SystemTime,
};

use async_trait::async_trait;
use fs2::FileExt;
use tokio::{
    io::AsyncReadExt,
    process::Command,
    sync::{OwnedRwLockReadGuard, RwLock},
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::Target;
use crate::error::{BuildFailure, ToolchainError, TrustError};
use crate::hashing::{file_digest, is_hex_digest};
use crate::provenance::{read_provenance, write_provenance, Provenance, PROVENANCE_FILE};
use crate::singleflight::SingleFlight;
use crate::upstream::Upstream;
use crate::usign::{self, PublicKey};

pub const SUMS_FILE: &str = "sha256sums";
pub const SIGNATURE_FILE: &str = "sha256sums.sig";
pub const ARCHIVE_PREFIX: &str = "openwrt-imagebuilder-";
pub const ARCHIVE_SUFFIX: &str = ".Linux-x86_64.tar.xz";

/// One toolchain exists per version and target/subtarget.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ToolchainKey {
    pub version: String,
    pub target: Target,
}

impl ToolchainKey {
    pub fn new(version: &str, target: Target) -> Self {
        Self {
            version: version.to_string(),
            target,
        }
    }
}

impl fmt::Display for ToolchainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.version, self.target)
    }
}

/// A verified toolchain extracted under the cache.
///
/// Toolchains handed out by a [`Bootstrapper`] carry a read lease on the live
/// tree, shared by every clone. A re-bootstrap of the same key swaps the tree
/// only after all leases are dropped.
#[derive(Clone)]
pub struct Toolchain {
    pub key: ToolchainKey,
    pub dir: PathBuf,
    lease: Option<Arc<OwnedRwLockReadGuard<()>>>,
}

impl PartialEq for Toolchain {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.dir == other.dir
    }
}

impl Eq for Toolchain {}

impl fmt::Debug for Toolchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Toolchain")
            .field("key", &self.key)
            .field("dir", &self.dir)
            .field("leased", &self.lease.is_some())
            .finish()
    }
}

impl Toolchain {
    /// A toolchain whose tree is never replaced while in use.
    pub fn new(key: ToolchainKey, dir: PathBuf) -> Self {
        Self {
            key,
            dir,
            lease: None,
        }
    }

    fn leased(key: ToolchainKey, dir: PathBuf, guard: OwnedRwLockReadGuard<()>) -> Self {
        Self {
            key,
            dir,
            lease: Some(Arc::new(guard)),
        }
    }

    pub fn provenance(&self) -> Option<Provenance> {
        read_provenance(&self.dir.join(PROVENANCE_FILE)).ok()
    }
}

#[async_trait]
pub trait ToolchainSource: Send + Sync {
    /// Returns a present, current toolchain, bootstrapping it first if needed.
    async fn ensure(&self, key: &ToolchainKey) -> Result<Toolchain, BuildFailure>;
}

/// Cache paths for one toolchain, all under `<cache>/<version>/<target>/`.
#[derive(Clone, Debug)]
struct ToolchainPaths {
    parent: PathBuf,
    live: PathBuf,
    sums: PathBuf,
    signature: PathBuf,
    lock: PathBuf,
}

impl ToolchainPaths {
    fn new(cache_dir: &Path, key: &ToolchainKey) -> Self {
        let parent = cache_dir.join(&key.version).join(&key.target.target);
        let sub = &key.target.subtarget;
        Self {
            live: parent.join(sub),
            sums: parent.join(format!("{sub}.{SUMS_FILE}")),
            signature: parent.join(format!("{sub}.{SIGNATURE_FILE}")),
            lock: parent.join(format!("{sub}.lock")),
            parent,
        }
    }

    fn is_present(&self) -> bool {
        self.live.is_dir() && self.signature.is_file()
    }
}

/// A remote checksum file strictly newer than the local copy makes the toolchain stale.
pub fn is_stale(local: SystemTime, remote: SystemTime) -> bool {
    remote > local
}

/// Finds the single toolchain archive line for `target` in a checksum manifest.
///
/// Accepts `<sha256> *<name>` and `<sha256>  <name>` lines.
pub fn find_archive(sums: &str, target: &Target) -> Result<(String, String), TrustError> {
    let wanted = format!("{}-{}", target.target, target.subtarget);
    let mut found: Vec<(String, String)> = Vec::new();

    for line in sums.lines() {
        let Some((hash, rest)) = line.split_once(' ') else {
            continue;
        };
        if !is_hex_digest(hash) {
            continue;
        }
        let name = rest
            .strip_prefix('*')
            .or_else(|| rest.strip_prefix(' '))
            .unwrap_or(rest)
            .trim_end();
        let Some(middle) = name
            .strip_prefix(ARCHIVE_PREFIX)
            .and_then(|n| n.strip_suffix(ARCHIVE_SUFFIX))
        else {
            continue;
        };
        if middle.ends_with(&wanted) {
            found.push((hash.to_ascii_lowercase(), name.to_string()));
        }
    }

    match found.len() {
        1 => Ok(found.remove(0)),
        0 => Err(TrustError::ManifestParse(format!(
            "no toolchain archive for {target} in {SUMS_FILE}"
        ))),
        n => Err(TrustError::ManifestParse(format!(
            "{n} toolchain archives match {target} in {SUMS_FILE}"
        ))),
    }
}

fn io_error(path: &Path, err: impl ToString) -> ToolchainError {
    ToolchainError::Io {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

/// Downloads, verifies, extracts and swaps in toolchains under a cache root.
#[derive(Clone)]
pub struct Bootstrapper {
    cache_dir: PathBuf,
    upstream: Arc<dyn Upstream>,
    public_key: String,
    inflight: Arc<SingleFlight<Result<Toolchain, BuildFailure>>>,
    gates: Arc<Mutex<HashMap<ToolchainKey, Arc<RwLock<()>>>>>,
}

impl Bootstrapper {
    pub fn new(cache_dir: PathBuf, upstream: Arc<dyn Upstream>, public_key: &str) -> Self {
        Self {
            cache_dir,
            upstream,
            public_key: public_key.to_string(),
            inflight: Arc::new(SingleFlight::new()),
            gates: Arc::default(),
        }
    }

    /// Readers are builds using the live tree; the writer is `swap_in`.
    fn gate(&self, key: &ToolchainKey) -> Arc<RwLock<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        gates.entry(key.clone()).or_default().clone()
    }

    /// Provenance of the live toolchain, if one is installed.
    pub fn installed(&self, key: &ToolchainKey) -> Option<Provenance> {
        let paths = ToolchainPaths::new(&self.cache_dir, key);
        if !paths.is_present() {
            return None;
        }
        read_provenance(&paths.live.join(PROVENANCE_FILE)).ok()
    }

    async fn ensure_locked(&self, key: ToolchainKey) -> Result<Toolchain, BuildFailure> {
        let paths = ToolchainPaths::new(&self.cache_dir, &key);
        fs::create_dir_all(&paths.parent).map_err(|e| io_error(&paths.parent, e))?;
        let _lock = lock_exclusive(paths.lock.clone()).await?;

        if paths.is_present() {
            let local = fs::metadata(&paths.signature)
                .and_then(|meta| meta.modified())
                .map_err(|e| io_error(&paths.signature, e))?;
            match self.upstream.last_modified(&key, SIGNATURE_FILE).await {
                Ok(remote) if !is_stale(local, remote) => {
                    info!("Toolchain {key} is current");
                    let lease = self.gate(&key).read_owned().await;
                    return Ok(Toolchain::leased(key, paths.live, lease));
                }
                Ok(_) => info!("Toolchain {key} is stale, bootstrapping"),
                Err(err) => {
                    warn!("Staleness check for {key} failed, reusing present toolchain: {err}");
                    let lease = self.gate(&key).read_owned().await;
                    return Ok(Toolchain::leased(key, paths.live, lease));
                }
            }
        } else {
            info!("Toolchain {key} is absent, bootstrapping");
        }

        let staging = paths.parent.join(format!(
            ".staging-{}-{}",
            key.target.subtarget,
            Uuid::new_v4()
        ));
        fs::create_dir_all(&staging).map_err(|e| io_error(&staging, e))?;
        let result = self.bootstrap(&key, &paths, &staging).await;
        let cleanup = staging.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || fs::remove_dir_all(cleanup))
            .await
            .unwrap_or_else(|e| Err(std::io::Error::other(e)))
        {
            warn!("Failed to clean staging dir {}: {err}", staging.display());
        }
        result
    }

    async fn bootstrap(
        &self,
        key: &ToolchainKey,
        paths: &ToolchainPaths,
        staging: &Path,
    ) -> Result<Toolchain, BuildFailure> {
        let signature = staging.join(SIGNATURE_FILE);
        let sums = staging.join(SUMS_FILE);
        self.upstream.download(key, SIGNATURE_FILE, &signature).await?;
        self.upstream.download(key, SUMS_FILE, &sums).await?;

        let sums_url = self.upstream.url(key, SUMS_FILE);
        match usign::check_files(&signature, &sums, &self.public_key) {
            Ok(true) => info!("Signature of {sums_url} verified"),
            Ok(false) => {
                warn!("Signature of {sums_url} does not verify against the trusted key");
                return Err(TrustError::BadSignature {
                    file: sums_url,
                    reason: "signature does not verify against the trusted key".into(),
                }
                .into());
            }
            Err(err) => {
                warn!("Signature of {sums_url} is malformed: {err}");
                return Err(TrustError::BadSignature {
                    file: sums_url,
                    reason: err.to_string(),
                }
                .into());
            }
        }

        let sums_text = fs::read_to_string(&sums).map_err(|e| io_error(&sums, e))?;
        let (expected, archive_name) = find_archive(&sums_text, &key.target)?;
        let archive = staging.join(&archive_name);
        self.upstream.download(key, &archive_name, &archive).await?;

        let digest_path = archive.clone();
        let actual = tokio::task::spawn_blocking(move || file_digest(&digest_path))
            .await
            .map_err(|e| io_error(&archive, e))?
            .map_err(|e| io_error(&archive, e))?;
        if actual != expected {
            warn!("Checksum mismatch for {archive_name}: expected {expected}, got {actual}");
            return Err(TrustError::ChecksumMismatch {
                file: archive_name,
                expected,
                actual,
            }
            .into());
        }

        let tree = staging.join("tree");
        fs::create_dir_all(&tree).map_err(|e| io_error(&tree, e))?;
        extract_archive(&archive, &tree).await?;
        let root = extracted_root(&tree)?;

        let upstream_modified = self
            .upstream
            .last_modified(key, SIGNATURE_FILE)
            .await
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(fwb_util::millis)
            .unwrap_or_default();
        let prov = Provenance {
            version: key.version.clone(),
            target: key.target.to_string(),
            archive_url: self.upstream.url(key, &archive_name),
            sha256: actual,
            signing_key_id: PublicKey::parse(&self.public_key)
                .map(|k| k.key_id_hex())
                .unwrap_or_default(),
            upstream_modified_unix_millis: upstream_modified,
            installed_at_unix_millis: fwb_util::now_millis(),
        };
        write_provenance(&root, &prov).map_err(|e| io_error(&root, e))?;

        info!("Waiting for builds on {key} to release the live toolchain");
        let writer = self.gate(key).write_owned().await;
        let target = paths.clone();
        tokio::task::spawn_blocking(move || swap_in(&root, &sums, &signature, &target))
            .await
            .map_err(|e| io_error(&paths.live, e))??;
        info!("Toolchain {key} installed at {}", paths.live.display());
        Ok(Toolchain::leased(
            key.clone(),
            paths.live.clone(),
            writer.downgrade(),
        ))
    }
}

#[async_trait]
impl ToolchainSource for Bootstrapper {
    async fn ensure(&self, key: &ToolchainKey) -> Result<Toolchain, BuildFailure> {
        let this = self.clone();
        let owned = key.clone();
        self.inflight
            .run(&key.to_string(), move || async move { this.ensure_locked(owned).await })
            .await
    }
}

async fn lock_exclusive(path: PathBuf) -> Result<fs::File, ToolchainError> {
    let lock_path = path.clone();
    tokio::task::spawn_blocking(move || {
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        file.lock_exclusive()?;
        Ok::<_, std::io::Error>(file)
    })
    .await
    .map_err(|e| io_error(&path, e))?
    .map_err(|e| io_error(&path, e))
}

/// Replaces the live tree, moving the signature last so its mtime marks a finished install.
fn swap_in(
    root: &Path,
    sums: &Path,
    signature: &Path,
    paths: &ToolchainPaths,
) -> Result<(), ToolchainError> {
    if paths.signature.exists() {
        fs::remove_file(&paths.signature).map_err(|e| io_error(&paths.signature, e))?;
    }
    if paths.live.exists() {
        fs::remove_dir_all(&paths.live).map_err(|e| io_error(&paths.live, e))?;
    }
    fs::rename(root, &paths.live).map_err(|e| io_error(&paths.live, e))?;
    fs::rename(sums, &paths.sums).map_err(|e| io_error(&paths.sums, e))?;
    fs::rename(signature, &paths.signature).map_err(|e| io_error(&paths.signature, e))?;
    Ok(())
}

/// The single top-level directory of an extracted archive, or the tree itself.
fn extracted_root(tree: &Path) -> Result<PathBuf, ToolchainError> {
    let mut dirs = Vec::new();
    let mut others = 0usize;
    for entry in fs::read_dir(tree).map_err(|e| io_error(tree, e))? {
        let entry = entry.map_err(|e| io_error(tree, e))?;
        let file_type = entry.file_type().map_err(|e| io_error(tree, e))?;
        if file_type.is_dir() {
            dirs.push(entry.path());
        } else {
            others += 1;
        }
    }
    if dirs.len() == 1 && others == 0 {
        Ok(dirs.remove(0))
    } else if dirs.is_empty() && others == 0 {
        Err(ToolchainError::Extraction("archive is empty".into()))
    } else {
        Ok(tree.to_path_buf())
    }
}

pub(crate) async fn extract_archive(archive: &Path, dest: &Path) -> Result<(), ToolchainError> {
    let mut cmd = Command::new("tar");
    cmd.arg("-xJf").arg(archive).arg("-C").arg(dest);
    info!("Extracting archive {} into {}", archive.display(), dest.display());

    cmd.stdout(Stdio::null()).stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|e| ToolchainError::Extraction(format!("failed to run tar: {e}")))?;

    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut err) = stderr {
            let _ = err.read_to_end(&mut buf).await;
        }
        buf
    });

    let status = child
        .wait()
        .await
        .map_err(|e| ToolchainError::Extraction(format!("failed to run tar: {e}")))?;
    let stderr = stderr_task.await.unwrap_or_default();

    if !status.success() {
        return Err(ToolchainError::Extraction(format!(
            "tar failed: {}\n{}",
            status,
            String::from_utf8_lossy(&stderr).trim()
        )));
    }
    Ok(())
}
