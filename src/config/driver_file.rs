//! Reader for the driver's flat `key: value` configuration file.
//!
//! Only top-level scalar entries are kept. Nested message blocks, comments
//! and blank lines are skipped, and surrounding quotes are stripped.

use std::collections::BTreeMap;

use camino::Utf8Path;
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use tracing::warn;

/// Key holding the cloud project in the driver configuration.
pub const PROJECT_KEY: &str = "project";
/// Key holding the cloud zone in the driver configuration.
pub const ZONE_KEY: &str = "zone";
/// Key holding the service account key path in the driver configuration.
pub const SERVICE_ACCOUNT_KEY: &str = "service_account_json_private_key_path";

/// Parsed driver configuration values.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DriverConfig {
    values: BTreeMap<String, String>,
}

impl DriverConfig {
    /// Parses configuration text.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut depth = 0_usize;
        let mut values = BTreeMap::new();
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.ends_with('{') {
                depth += 1;
                continue;
            }
            if line.starts_with('}') {
                depth = depth.saturating_sub(1);
                continue;
            }
            if depth > 0 {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            values.insert(key.to_owned(), unquote(value.trim()).to_owned());
        }
        Self { values }
    }

    /// Returns the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Cloud project the driver launches into.
    #[must_use]
    pub fn project(&self) -> Option<&str> {
        self.get(PROJECT_KEY)
    }

    /// Cloud zone the driver launches into.
    #[must_use]
    pub fn zone(&self) -> Option<&str> {
        self.get(ZONE_KEY)
    }

    /// Service account key configured for the driver.
    #[must_use]
    pub fn service_account_key(&self) -> Option<&str> {
        self.get(SERVICE_ACCOUNT_KEY)
    }

    /// Consumes the parsed values.
    #[must_use]
    pub fn into_map(self) -> BTreeMap<String, String> {
        self.values
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .or_else(|| {
            value
                .strip_prefix('\'')
                .and_then(|rest| rest.strip_suffix('\''))
        })
        .unwrap_or(value)
}

/// Reads the driver configuration at `path`. A missing or unreadable file is
/// logged and yields `None`.
#[must_use]
pub fn parse_driver_config(path: &Utf8Path) -> Option<DriverConfig> {
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name()?;
    let text = Dir::open_ambient_dir(parent, ambient_authority())
        .and_then(|dir| dir.read_to_string(file_name));
    match text {
        Ok(contents) => Some(DriverConfig::parse(&contents)),
        Err(err) => {
            warn!(path = %path, error = %err, "could not read driver configuration");
            None
        }
    }
}
