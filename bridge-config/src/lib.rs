// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

//! Loading and saving of on-disk configuration.
//!
//! Any serde struct opts in by implementing the [`Config`] marker trait;
//! YAML and JSON are both accepted on load, keyed off the file extension.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

pub trait Config: Serialize + DeserializeOwned {
    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config at {}", path.display()))?;
        let is_yaml = matches!(
            path.extension().and_then(|s| s.to_str()),
            Some("yaml") | Some("yml")
        );
        let config = if is_yaml {
            serde_yaml::from_str(&content)
                .with_context(|| format!("malformed yaml config at {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("malformed json config at {}", path.display()))?
        };
        Ok(config)
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    fn persisted(self, path: &Path) -> PersistedConfig<Self>
    where
        Self: Sized,
    {
        PersistedConfig {
            inner: self,
            path: path.to_path_buf(),
        }
    }
}

/// A config value bound to the file it came from.
pub struct PersistedConfig<C> {
    inner: C,
    path: PathBuf,
}

impl<C: Config> PersistedConfig<C> {
    pub fn reload(&self) -> Result<C> {
        C::load(&self.path)
    }

    pub fn save(&self) -> Result<()> {
        self.inner.save(&self.path)
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    struct Sample {
        home_dir: String,
        rollback_gap: u64,
    }

    impl Config for Sample {}

    #[test]
    fn json_round_trip() {
        let dir = std::env::temp_dir().join("oppy-bridge-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sample.json");

        let sample = Sample {
            home_dir: "/data".into(),
            rollback_gap: 15,
        };
        sample.save(&path).unwrap();
        assert_eq!(Sample::load(&path).unwrap(), sample);
    }

    #[test]
    fn yaml_is_accepted_by_extension() {
        let dir = std::env::temp_dir().join("oppy-bridge-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sample.yaml");
        std::fs::write(&path, "home-dir: /data\nrollback-gap: 3\n").unwrap();
        let loaded = Sample::load(&path).unwrap();
        assert_eq!(loaded.rollback_gap, 3);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Sample::load("/definitely/not/here.json").is_err());
    }
}
