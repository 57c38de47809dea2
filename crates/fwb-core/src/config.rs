use std::path::PathBuf;

use fwb_util::{data_dir, env_or, env_path, env_usize};

use crate::jobs::Retention;

pub const DEFAULT_UPSTREAM_URL: &str = "https://downloads.openwrt.org";
/// usign key that signs OpenWrt release and snapshot checksum files.
pub const DEFAULT_UPSTREAM_KEY: &str = "RWS1BD5w+adc3j2Hqg9+b66CvLR7NlHbsj7wjNVj0XGt/othDgIAOJS+";
pub const DEFAULT_STORE_URL: &str = "http://localhost:5000/store";
pub const DEFAULT_WORKERS: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Production,
    Development,
}

impl Mode {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Mode::Production,
            _ => Mode::Development,
        }
    }

    pub fn retention(self) -> Retention {
        match self {
            Mode::Production => Retention::production(),
            Mode::Development => Retention::development(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub store_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub catalog_dir: PathBuf,
    pub upstream_url: String,
    pub upstream_key: String,
    pub store_url: String,
    pub workers: usize,
    pub mode: Mode,
    pub make: String,
}

impl Config {
    pub fn from_env() -> Self {
        let base = data_dir();
        Self {
            store_dir: env_path("FWB_STORE_DIR", base.join("store")),
            cache_dir: env_path("FWB_CACHE_DIR", base.join("cache")),
            catalog_dir: env_path("FWB_CATALOG_DIR", base.join("catalog")),
            upstream_url: env_or("FWB_UPSTREAM_URL", DEFAULT_UPSTREAM_URL),
            upstream_key: env_or("FWB_UPSTREAM_KEY", DEFAULT_UPSTREAM_KEY),
            store_url: env_or("FWB_STORE_URL", DEFAULT_STORE_URL),
            workers: env_usize("FWB_WORKERS", DEFAULT_WORKERS),
            mode: Mode::parse(&env_or("FWB_MODE", "development")),
            make: env_or("FWB_MAKE", "make"),
        }
    }

    pub fn retention(&self) -> Retention {
        self.mode.retention()
    }

    /// Public location of a store slot.
    pub fn public_url(&self, relative_dir: &str) -> String {
        format!("{}/{}", self.store_url.trim_end_matches('/'), relative_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn mode_selects_retention() {
        assert_eq!(Mode::parse("Production"), Mode::Production);
        assert_eq!(Mode::parse("debug"), Mode::Development);
        assert_eq!(
            Mode::Production.retention().result_ttl,
            Duration::from_secs(86_400)
        );
        assert_eq!(
            Mode::Development.retention().failure_ttl,
            Duration::from_secs(900)
        );
    }

    #[test]
    fn public_url_joins_store_prefix() {
        let mut config = Config::from_env();
        config.store_url = "https://fw.example.org/store/".into();
        assert_eq!(
            config.public_url("SNAPSHOT/ath79/generic/generic-ath79/0123456789ab"),
            "https://fw.example.org/store/SNAPSHOT/ath79/generic/generic-ath79/0123456789ab"
        );
    }
}
