//! Layered settings: built-in defaults, then an optional TOML file, then
//! `HARVEST__*` environment variables. CLI flags are applied on top by the
//! binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::page::Waits;
use crate::pipeline::{Field, FieldPolicy};
use crate::sampler::{Sampler, UnderQuota};
use crate::session::Browser;

pub const DEFAULT_CONFIG_FILE: &str = "harvest.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub paths: Paths,
    /// Class groups to skip, by name or file name.
    pub exclude_groups: Vec<String>,
    pub sampling: Sampling,
    pub webdriver: WebDriver,
    pub page: Page,
    pub fields: Fields,
    pub claim_ttl_secs: u64,
    pub expand_existing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Paths {
    pub class_dir: PathBuf,
    pub json_dir: PathBuf,
    pub image_dir: PathBuf,
    pub ground_truth_dir: PathBuf,
    pub ledger: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sampling {
    pub quota: usize,
    pub seed: u64,
    pub under_quota: UnderQuota,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebDriver {
    pub url: String,
    pub browser: Browser,
    pub headless: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Page {
    pub base_url: String,
    pub element_timeout_ms: u64,
    pub claim_timeout_ms: u64,
    pub download_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Fields {
    /// Fields allowed to come back empty. Every other field is required.
    pub optional: Vec<Field>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            paths: Paths::default(),
            exclude_groups: Vec::new(),
            sampling: Sampling::default(),
            webdriver: WebDriver::default(),
            page: Page::default(),
            fields: Fields::default(),
            claim_ttl_secs: 6 * 60 * 60,
            expand_existing: false,
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        let data = PathBuf::from("data");
        Self {
            class_dir: data.join("classes"),
            json_dir: data.join("json"),
            image_dir: data.join("front_imgs"),
            ground_truth_dir: data.join("ground_truth"),
            ledger: data.join("harvest.sqlite"),
        }
    }
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            quota: 5,
            seed: 1999,
            under_quota: UnderQuota::Strict,
        }
    }
}

impl Default for WebDriver {
    fn default() -> Self {
        Self {
            url: "http://localhost:4444".into(),
            browser: Browser::Firefox,
            headless: true,
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            base_url: "https://patents.google.com".into(),
            element_timeout_ms: 5_000,
            claim_timeout_ms: 10_000,
            download_timeout_ms: 30_000,
        }
    }
}

impl Settings {
    /// Load settings. `file` must exist when given; otherwise
    /// `harvest.toml` in the working directory is used if present.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&Settings::default()).context("encoding default settings")?;
        let mut builder = Config::builder().add_source(defaults);

        builder = match file {
            Some(path) => builder.add_source(File::from(path).format(FileFormat::Toml).required(true)),
            None => builder.add_source(
                File::with_name(DEFAULT_CONFIG_FILE)
                    .format(FileFormat::Toml)
                    .required(false),
            ),
        };

        builder
            .add_source(
                Environment::with_prefix("HARVEST")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("exclude_groups")
                    .with_list_parse_key("fields.optional")
                    .try_parsing(true),
            )
            .build()
            .context("reading configuration")?
            .try_deserialize()
            .context("invalid configuration")
    }

    pub fn sampler(&self) -> Sampler {
        Sampler::new(self.sampling.quota, self.sampling.seed).with_policy(self.sampling.under_quota)
    }

    pub fn field_policy(&self) -> FieldPolicy {
        FieldPolicy::with_optional(self.fields.optional.iter().copied())
    }

    pub fn waits(&self) -> Waits {
        Waits {
            short: Duration::from_millis(self.page.element_timeout_ms),
            long: Duration::from_millis(self.page.claim_timeout_ms),
        }
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_harvesting_scripts() {
        let settings = Settings::default();
        assert_eq!(settings.sampling.quota, 5);
        assert_eq!(settings.sampling.seed, 1999);
        assert_eq!(settings.sampling.under_quota, UnderQuota::Strict);
        assert!(settings.field_policy().is_required(Field::FrontImage));
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harvest.toml");
        std::fs::write(
            &path,
            r#"
exclude_groups = ["A62B18.txt", "F04D17"]
expand_existing = true

[sampling]
quota = 3
under_quota = "available"

[fields]
optional = ["front_image"]
"#,
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.sampling.quota, 3);
        assert_eq!(settings.sampling.seed, 1999);
        assert_eq!(settings.sampling.under_quota, UnderQuota::Available);
        assert_eq!(settings.exclude_groups, vec!["A62B18.txt", "F04D17"]);
        assert!(settings.expand_existing);
        assert!(!settings.field_policy().is_required(Field::FrontImage));
        assert!(settings.field_policy().is_required(Field::Title));
        assert_eq!(settings.paths.json_dir, PathBuf::from("data/json"));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        assert!(Settings::load(Some(Path::new("/no/such/harvest.toml"))).is_err());
    }
}
