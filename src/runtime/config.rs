// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::{
    env,
    fs,
    time::Duration,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Environment variable naming the YAML configuration file.
const CONFIG_PATH_VAR: &str = "IVORY_CONFIG";

/// Default maximum number of readiness events drained per poll.
const DEFAULT_POLL_BATCH_SIZE: usize = 1024;

/// Default grace period for at-shutdown hooks.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Runtime tunables.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of readiness events drained per poll.
    pub poll_batch_size: usize,
    /// How long the shutdown flow waits for at-shutdown hooks before giving up.
    pub shutdown_timeout: Duration,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for the Configuration
impl Config {
    /// Builds the configuration from the file named by IVORY_CONFIG, or from defaults when the variable is unset.
    /// A named-but-malformed file is a startup error.
    pub fn from_env() -> Self {
        match env::var(CONFIG_PATH_VAR) {
            Ok(path) => match Self::load(&path) {
                Ok(config) => config,
                Err(e) => panic!("malformed configuration file {:?}: {:?}", path, e),
            },
            Err(_) => Self::default(),
        }
    }

    /// Loads the configuration from a YAML file. Absent keys fall back to defaults.
    pub fn load(path: &str) -> Result<Self, Fail> {
        let contents: String = fs::read_to_string(path).map_err(Fail::from)?;
        let docs: Vec<Yaml> = match YamlLoader::load_from_str(&contents) {
            Ok(docs) => docs,
            Err(e) => {
                let cause: String = format!("could not parse configuration: {:?}", e);
                error!("load(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let doc: &Yaml = match &docs[..] {
            [doc] => doc,
            _ => {
                let cause: &str = "configuration must hold exactly one document";
                error!("load(): {}", cause);
                return Err(Fail::new(libc::EINVAL, cause));
            },
        };

        let poll_batch_size: usize = match doc["ivory"]["poll_batch_size"].as_i64() {
            Some(size) if size > 0 => size as usize,
            Some(_) => {
                let cause: &str = "poll_batch_size must be positive";
                error!("load(): {}", cause);
                return Err(Fail::new(libc::EINVAL, cause));
            },
            None => DEFAULT_POLL_BATCH_SIZE,
        };
        let shutdown_timeout: Duration = match doc["ivory"]["shutdown_timeout_secs"].as_i64() {
            Some(secs) if secs >= 0 => Duration::from_secs(secs as u64),
            Some(_) => {
                let cause: &str = "shutdown_timeout_secs must be nonnegative";
                error!("load(): {}", cause);
                return Err(Fail::new(libc::EINVAL, cause));
            },
            None => DEFAULT_SHUTDOWN_TIMEOUT,
        };

        Ok(Self {
            poll_batch_size,
            shutdown_timeout,
        })
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_batch_size: DEFAULT_POLL_BATCH_SIZE,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Config;
    use ::anyhow::Result;
    use ::std::{
        fs,
        path::PathBuf,
        time::Duration,
    };

    fn scratch_file(name: &str, contents: &str) -> Result<PathBuf> {
        let mut path: PathBuf = std::env::temp_dir();
        path.push(format!("ivory-config-test-{}-{}", std::process::id(), name));
        fs::write(&path, contents)?;
        Ok(path)
    }

    /// Tests that configured values override the defaults.
    #[test]
    fn load_reads_configured_values() -> Result<()> {
        let path: PathBuf = scratch_file(
            "configured",
            "ivory:\n  poll_batch_size: 64\n  shutdown_timeout_secs: 3\n",
        )?;
        let config: Config = Config::load(path.to_str().unwrap())?;
        let _ = fs::remove_file(&path);
        crate::ensure_eq!(config.poll_batch_size, 64);
        crate::ensure_eq!(config.shutdown_timeout, Duration::from_secs(3));
        Ok(())
    }

    /// Tests that absent keys fall back to defaults.
    #[test]
    fn load_defaults_absent_keys() -> Result<()> {
        let path: PathBuf = scratch_file("sparse", "ivory:\n  poll_batch_size: 16\n")?;
        let config: Config = Config::load(path.to_str().unwrap())?;
        let _ = fs::remove_file(&path);
        crate::ensure_eq!(config.poll_batch_size, 16);
        crate::ensure_eq!(config.shutdown_timeout, Config::default().shutdown_timeout);
        Ok(())
    }

    /// Tests that nonsense values are rejected.
    #[test]
    fn load_rejects_invalid_values() -> Result<()> {
        let path: PathBuf = scratch_file("invalid", "ivory:\n  poll_batch_size: -5\n")?;
        let result: Result<Config, _> = Config::load(path.to_str().unwrap());
        let _ = fs::remove_file(&path);
        crate::ensure_eq!(result.is_err(), true);
        Ok(())
    }
}
