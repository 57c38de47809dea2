//! Error kinds surfaced by validation, toolchain bootstrap and builds.

use thiserror::Error;

/// Client-caused rejection; no job is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Unknown distro: {0}")]
    BadDistro(String),

    #[error("Unknown version: {0}")]
    BadVersion(String),

    #[error("Unknown profile: {0}")]
    BadProfile(String),

    #[error("Unknown package(s): {}", .0.join(", "))]
    BadPackages(Vec<String>),
}

impl ValidationError {
    pub fn status(&self) -> &'static str {
        match self {
            Self::BadDistro(_) => "bad_distro",
            Self::BadVersion(_) => "bad_version",
            Self::BadProfile(_) => "bad_profile",
            Self::BadPackages(_) => "bad_packages",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadPackages(_) => 422,
            _ => 400,
        }
    }
}

/// Upstream data failed an integrity check.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrustError {
    #[error("bad signature for {file}: {reason}")]
    BadSignature { file: String, reason: String },

    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("checksum manifest parse failure: {0}")]
    ManifestParse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolchainError {
    #[error("download failed for {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("toolchain cache error at {path}: {reason}")]
    Io { path: String, reason: String },
}

/// The external toolchain exited non-zero or produced unusable output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("manifest resolution failed: {0}")]
    ManifestResolution(String),

    #[error("image build failed: {0}")]
    ImageBuild(String),
}

/// Terminal failure of a job body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildFailure {
    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error(transparent)]
    Toolchain(#[from] ToolchainError),

    #[error(transparent)]
    Build(#[from] BuildError),
}

impl BuildFailure {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Trust(TrustError::BadSignature { .. }) => "bad_signature",
            Self::Trust(TrustError::ChecksumMismatch { .. }) => "checksum_mismatch",
            Self::Trust(TrustError::ManifestParse(_)) => "manifest_parse_failure",
            Self::Toolchain(ToolchainError::Download { .. }) => "download_failure",
            Self::Toolchain(ToolchainError::Extraction(_) | ToolchainError::Io { .. }) => {
                "extraction_failure"
            }
            Self::Build(BuildError::ManifestResolution(_)) => "manifest_resolution_failed",
            Self::Build(BuildError::ImageBuild(_)) => "image_build_failed",
        }
    }

    /// Toolchain infrastructure failures leave no live state behind and may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Toolchain(_))
    }
}

/// Structural problems with usign key or signature blobs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("public key must decode to 42 bytes, got {0}")]
    MalformedKey(usize),

    #[error("signature must decode to 74 bytes, got {0}")]
    MalformedSignature(usize),

    #[error("invalid base64: {0}")]
    Encoding(String),

    #[error("unsupported signature algorithm {0:?}")]
    UnsupportedAlgorithm(String),

    #[error("invalid public key: {0}")]
    InvalidKey(String),

    #[error("failed to read {path}: {reason}")]
    Io { path: String, reason: String },
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("profile {profile} has malformed target {target:?}")]
    BadTarget { profile: String, target: String },
}

/// Startup failures while wiring the service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Toolchain(#[from] ToolchainError),
}
