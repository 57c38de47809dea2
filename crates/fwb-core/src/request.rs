use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, Target, DEFAULT_DISTRO};
use crate::error::ValidationError;
use crate::hashing::{packages_digest, short_digest};

/// Client input as received; every field is checked by [`normalize`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildRequest {
    pub distro: Option<String>,
    pub version: Option<String>,
    pub profile: Option<String>,
    pub packages: Vec<String>,
    pub diff_packages: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PackageSelector {
    Add(String),
    Remove(String),
}

impl PackageSelector {
    pub fn parse(value: &str) -> Self {
        match value.strip_prefix('-') {
            Some(name) => Self::Remove(name.to_string()),
            None => Self::Add(value.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Add(name) | Self::Remove(name) => name,
        }
    }
}

impl fmt::Display for PackageSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add(name) => write!(f, "{name}"),
            Self::Remove(name) => write!(f, "-{name}"),
        }
    }
}

/// A validated request with its target resolved from the catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NormalizedRequest {
    pub distro: String,
    pub version: String,
    pub profile: String,
    pub target: Target,
    /// Selector strings, sorted and de-duplicated.
    pub packages: BTreeSet<String>,
    pub diff_packages: bool,
}

impl NormalizedRequest {
    pub fn fingerprint(&self) -> RequestFingerprint {
        fingerprint_parts(
            &self.distro,
            &self.version,
            &self.profile,
            &self.packages,
            self.diff_packages,
        )
    }

    pub fn selectors(&self) -> Vec<PackageSelector> {
        self.packages.iter().map(|p| PackageSelector::parse(p)).collect()
    }
}

/// Job dedup key: short digest over the canonical request tuple.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint of raw input, computed without consulting the catalog.
///
/// Equal to [`NormalizedRequest::fingerprint`] for any request that validates.
pub fn fingerprint(raw: &BuildRequest) -> RequestFingerprint {
    fingerprint_parts(
        &raw_distro(raw),
        raw.version.as_deref().unwrap_or_default().trim(),
        raw.profile.as_deref().unwrap_or_default().trim(),
        &canonical_packages(&raw.packages),
        raw.diff_packages,
    )
}

pub fn normalize(raw: &BuildRequest, catalog: &Catalog) -> Result<NormalizedRequest, ValidationError> {
    let distro = raw_distro(raw);
    if !catalog.has_distro(&distro) {
        return Err(ValidationError::BadDistro(distro));
    }

    let version = raw.version.as_deref().unwrap_or_default().trim();
    if version.is_empty() {
        return Err(ValidationError::BadVersion("Missing version".into()));
    }
    let version_catalog = catalog
        .version(version)
        .ok_or_else(|| ValidationError::BadVersion(version.to_string()))?;

    let profile = raw.profile.as_deref().unwrap_or_default().trim();
    if profile.is_empty() {
        return Err(ValidationError::BadProfile("Missing profile".into()));
    }
    let target = version_catalog
        .profile_target(profile)
        .ok_or_else(|| ValidationError::BadProfile(profile.to_string()))?
        .clone();

    let packages = canonical_packages(&raw.packages);
    let unknown: BTreeSet<String> = packages
        .iter()
        .map(|p| PackageSelector::parse(p).name().to_string())
        .filter(|name| !version_catalog.has_package(name))
        .collect();
    if !unknown.is_empty() {
        return Err(ValidationError::BadPackages(unknown.into_iter().collect()));
    }

    Ok(NormalizedRequest {
        distro,
        version: version.to_string(),
        profile: profile.to_string(),
        target,
        packages,
        diff_packages: raw.diff_packages,
    })
}

fn raw_distro(raw: &BuildRequest) -> String {
    raw.distro
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .unwrap_or(DEFAULT_DISTRO)
        .to_string()
}

fn canonical_packages(packages: &[String]) -> BTreeSet<String> {
    packages
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty() && *p != "-")
        .map(str::to_string)
        .collect()
}

fn fingerprint_parts(
    distro: &str,
    version: &str,
    profile: &str,
    packages: &BTreeSet<String>,
    diff_packages: bool,
) -> RequestFingerprint {
    let tuple = (distro, version, profile, packages_digest(packages), diff_packages);
    // A JSON array keeps field boundaries unambiguous.
    let canonical = serde_json::to_string(&tuple).unwrap_or_default();
    RequestFingerprint(short_digest(&canonical))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::VersionCatalog;

    fn catalog() -> Catalog {
        Catalog::default().with_version(
            "SNAPSHOT",
            VersionCatalog::new()
                .with_profile("generic-ath79", Target::new("ath79", "generic"))
                .with_packages(["luci", "vim", "dnsmasq"]),
        )
    }

    fn request(packages: &[&str]) -> BuildRequest {
        BuildRequest {
            distro: None,
            version: Some("SNAPSHOT".into()),
            profile: Some("generic-ath79".into()),
            packages: packages.iter().map(|p| p.to_string()).collect(),
            diff_packages: false,
        }
    }

    #[test]
    fn normalize_resolves_target_and_dedups_packages() {
        let normalized = normalize(&request(&["vim", "luci", "vim", " "]), &catalog()).unwrap();
        assert_eq!(normalized.distro, "openwrt");
        assert_eq!(normalized.target, Target::new("ath79", "generic"));
        assert_eq!(
            normalized.packages.iter().cloned().collect::<Vec<_>>(),
            vec!["luci".to_string(), "vim".to_string()]
        );
    }

    #[test]
    fn removal_marker_is_stripped_for_validation_only() {
        let normalized = normalize(&request(&["-dnsmasq", "luci"]), &catalog()).unwrap();
        assert!(normalized.packages.contains("-dnsmasq"));
        assert_eq!(
            normalized.selectors(),
            vec![
                PackageSelector::Remove("dnsmasq".into()),
                PackageSelector::Add("luci".into())
            ]
        );
    }

    #[test]
    fn rejects_unknown_fields() {
        let mut raw = request(&[]);
        raw.distro = Some("lede".into());
        assert_eq!(
            normalize(&raw, &catalog()),
            Err(ValidationError::BadDistro("lede".into()))
        );

        let mut raw = request(&[]);
        raw.version = Some("1.0".into());
        assert_eq!(normalize(&raw, &catalog()).unwrap_err().status(), "bad_version");

        let mut raw = request(&[]);
        raw.version = None;
        assert_eq!(normalize(&raw, &catalog()).unwrap_err().status(), "bad_version");

        let mut raw = request(&[]);
        raw.profile = Some("unknown-board".into());
        assert_eq!(
            normalize(&raw, &catalog()),
            Err(ValidationError::BadProfile("unknown-board".into()))
        );
    }

    #[test]
    fn unknown_packages_are_listed() {
        let err = normalize(&request(&["luci", "not-a-real-package", "-ghost"]), &catalog())
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::BadPackages(vec!["ghost".into(), "not-a-real-package".into()])
        );
    }

    #[test]
    fn fingerprint_is_order_and_duplicate_independent() {
        let a = fingerprint(&request(&["luci", "vim"]));
        let b = fingerprint(&request(&["vim", "luci", "luci"]));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 12);
        assert_eq!(a, fingerprint(&request(&["luci", "vim"])));
    }

    #[test]
    fn raw_and_normalized_fingerprints_agree() {
        let raw = request(&["vim", " luci"]);
        let normalized = normalize(&raw, &catalog()).unwrap();
        assert_eq!(fingerprint(&raw), normalized.fingerprint());

        let mut explicit = raw.clone();
        explicit.distro = Some("openwrt".into());
        assert_eq!(fingerprint(&explicit), fingerprint(&raw));
    }

    #[test]
    fn fingerprint_covers_every_field() {
        let base = request(&["luci"]);
        let mut diff = base.clone();
        diff.diff_packages = true;
        let mut profile = base.clone();
        profile.profile = Some("other".into());
        let removal = request(&["-luci"]);

        let base_fp = fingerprint(&base);
        assert_ne!(base_fp, fingerprint(&diff));
        assert_ne!(base_fp, fingerprint(&profile));
        assert_ne!(base_fp, fingerprint(&removal));
    }

    #[test]
    fn field_boundaries_do_not_collide() {
        let mut a = request(&[]);
        a.version = Some("SNAPSHOT x".into());
        a.profile = Some("y".into());
        let mut b = request(&[]);
        b.version = Some("SNAPSHOT".into());
        b.profile = Some("x y".into());
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }
}
