// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration file handling.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::bluetooth::WandSettings;

const APP_DIR: &str = "planetnine-ble";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the trust service.
    pub trust_base_url: String,
    /// Advertised name prefix of wands.
    pub wand_name_prefix: String,
    pub reconnect_delay_ms: u64,
    /// Unbounded when absent.
    pub max_reconnect_attempts: Option<u32>,
    /// Local name used while advertising a key.
    pub advertised_name: String,
    /// Where persistent state is kept. Defaults to the user data directory.
    pub data_dir: Option<PathBuf>,
    pub http_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trust_base_url: "https://julia.planetnine.app".to_string(),
            wand_name_prefix: crate::bluetooth::ble_constants::wand::NAME_PREFIX.to_string(),
            reconnect_delay_ms: crate::bluetooth::ble_constants::wand::RECONNECT_DELAY.as_millis()
                as u64,
            max_reconnect_attempts: None,
            advertised_name: "PlanetNine".to_string(),
            data_dir: None,
            http_timeout_secs: 15,
        }
    }
}

impl Config {
    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR).join("config.toml"))
    }

    /// Load from `path`, or from the default location. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => path,
            None => {
                debug!("No config directory, using defaults");
                return Ok(Self::default());
            }
        };

        if !path.exists() {
            debug!("Config file {:?} doesn't exist, using defaults", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))?;
        config.validate()?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.wand_name_prefix.is_empty() {
            bail!("wand_name_prefix must not be empty");
        }
        if self.reconnect_delay_ms == 0 {
            bail!("reconnect_delay_ms must be greater than zero");
        }
        if self.trust_base_url.is_empty() {
            bail!("trust_base_url must not be empty");
        }
        Ok(())
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_local_dir()
                .map(|d| d.join(APP_DIR))
                .context("Failed to get local data directory"),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn wand_settings(&self) -> WandSettings {
        WandSettings {
            name_prefix: self.wand_name_prefix.clone(),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }
}
