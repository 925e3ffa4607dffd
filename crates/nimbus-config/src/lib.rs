// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for the orchestrator core.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    /// Front-end host name, prefixed to local image paths in transfer
    /// commands.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Root of the per-VM working directories holding transfer scripts.
    #[serde(default = "default_var_location")]
    pub var_location: PathBuf,

    /// Root under which system datastores are mounted on every host.
    #[serde(default = "default_datastore_location")]
    pub datastore_location: PathBuf,

    #[serde(default = "default_vnc_base_port")]
    pub vnc_base_port: u32,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub transfer_driver: DriverConfig,

    /// Hypervisor drivers, keyed by the name hosts refer to them by.
    #[serde(default, rename = "vmm_driver")]
    pub vmm_drivers: BTreeMap<String, VmmDriverConfig>,
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_var_location() -> PathBuf {
    PathBuf::from("/var/lib/nimbus")
}

fn default_datastore_location() -> PathBuf {
    PathBuf::from("/var/lib/nimbus/datastores")
}

fn default_vnc_base_port() -> u32 {
    5900
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            hostname: default_hostname(),
            var_location: default_var_location(),
            datastore_location: default_datastore_location(),
            vnc_base_port: default_vnc_base_port(),
            log_level: default_log_level(),
            transfer_driver: DriverConfig::default(),
            vmm_drivers: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Capability flags of the hypervisor driver `name`. Unknown drivers get
    /// the defaults.
    pub fn vmm_driver(&self, name: &str) -> VmmDriverConfig {
        self.vmm_drivers.get(name).cloned().unwrap_or_default()
    }

    /// Directory holding the working files of VM `vid`.
    pub fn vm_dir(&self, vid: u32) -> PathBuf {
        self.var_location.join("vms").join(vid.to_string())
    }

    /// Directory of VM `vid` inside system datastore `ds_id`.
    pub fn system_dir(&self, ds_id: u32, vid: u32) -> String {
        self.datastore_location
            .join(ds_id.to_string())
            .join(vid.to_string())
            .to_string_lossy()
            .into_owned()
    }
}

/// An external driver executable.
#[derive(Default, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<PathBuf>,
    #[serde(default)]
    pub arguments: Vec<String>,
}

#[derive(Default, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VmmDriverConfig {
    #[serde(flatten)]
    pub driver: DriverConfig,

    /// Hypervisor snapshots survive a migration.
    #[serde(default)]
    pub keep_snapshots: bool,

    /// NICs can only be attached while the VM is powered off.
    #[serde(default)]
    pub cold_nic_attach: bool,

    /// CPU and memory can be changed while the VM runs.
    #[serde(default)]
    pub live_resize: bool,
}

/// Errors which may be returned when parsing the configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    Ok(cfg)
}
