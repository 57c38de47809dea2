use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fmt, fs,
    path::Path,
};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::CatalogError;

pub const DEFAULT_DISTRO: &str = "openwrt";

/// A `target/subtarget` pair selecting one toolchain build.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    pub target: String,
    pub subtarget: String,
}

impl Target {
    pub fn new(target: &str, subtarget: &str) -> Self {
        Self {
            target: target.to_string(),
            subtarget: subtarget.to_string(),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (target, subtarget) = value.trim().split_once('/')?;
        if target.is_empty() || subtarget.is_empty() || subtarget.contains('/') {
            return None;
        }
        Some(Self::new(target, subtarget))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.target, self.subtarget)
    }
}

#[derive(Clone, Debug, Default)]
pub struct VersionCatalog {
    profiles: HashMap<String, Target>,
    packages: HashSet<String>,
}

impl VersionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, profile: &str, target: Target) -> Self {
        self.profiles.insert(profile.to_string(), target);
        self
    }

    pub fn with_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages.extend(packages.into_iter().map(Into::into));
        self
    }

    pub fn profile_target(&self, profile: &str) -> Option<&Target> {
        self.profiles.get(profile)
    }

    pub fn has_package(&self, name: &str) -> bool {
        self.packages.contains(name)
    }

    pub fn profile_count(&self) -> usize {
        self.profiles.len()
    }

    pub fn package_count(&self) -> usize {
        self.packages.len()
    }
}

/// Immutable snapshot of distros, versions, profiles and package names.
#[derive(Clone, Debug)]
pub struct Catalog {
    distros: BTreeSet<String>,
    versions: BTreeMap<String, VersionCatalog>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            distros: BTreeSet::from([DEFAULT_DISTRO.to_string()]),
            versions: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VersionsFile {
    List(Vec<String>),
    Map(BTreeMap<String, serde_json::Value>),
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct ProfilesFile {
    profiles: BTreeMap<String, ProfileEntry>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct ProfileEntry {
    target: String,
}

impl Catalog {
    pub fn with_version(mut self, version: &str, catalog: VersionCatalog) -> Self {
        self.versions.insert(version.to_string(), catalog);
        self
    }

    pub fn has_distro(&self, distro: &str) -> bool {
        self.distros.contains(distro)
    }

    pub fn version(&self, version: &str) -> Option<&VersionCatalog> {
        self.versions.get(version)
    }

    pub fn versions(&self) -> impl Iterator<Item = &str> {
        self.versions.keys().map(String::as_str)
    }

    /// Loads `versions.json`, then `profiles-<v>.json` and `packages-<v>.json` per version.
    pub fn load(dir: &Path) -> Result<Self, CatalogError> {
        let versions: VersionsFile = read_json(&dir.join("versions.json"))?;
        let versions = match versions {
            VersionsFile::List(list) => list,
            VersionsFile::Map(map) => map.into_keys().collect(),
        };

        let mut catalog = Catalog::default();
        for version in versions {
            let profiles: ProfilesFile = read_json(&dir.join(format!("profiles-{version}.json")))?;
            let packages: Vec<String> = read_json(&dir.join(format!("packages-{version}.json")))?;

            let mut entry = VersionCatalog::new().with_packages(packages);
            for (profile, item) in profiles.profiles {
                let target = Target::parse(&item.target).ok_or_else(|| CatalogError::BadTarget {
                    profile: profile.clone(),
                    target: item.target.clone(),
                })?;
                entry = entry.with_profile(&profile, target);
            }
            info!(
                "Loaded {} profiles and {} packages in {}",
                entry.profile_count(),
                entry.package_count(),
                version
            );
            catalog.versions.insert(version, entry);
        }
        info!("Loaded {} versions", catalog.versions.len());
        Ok(catalog)
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, CatalogError> {
    let raw = fs::read_to_string(path).map_err(|e| CatalogError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&raw).map_err(|e| CatalogError::Parse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}
