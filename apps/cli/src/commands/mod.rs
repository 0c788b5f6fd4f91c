//! Subcommand implementations.

pub mod models;
pub mod run;
pub mod visualize;

use crate::args::GlobalArgs;
use anyhow::Result;
use dialogkt_training::ConfigFile;

/// Loads the `--config` file, if one was given.
pub(crate) fn load_config_file(global: &GlobalArgs) -> Result<Option<ConfigFile>> {
    Ok(global.config.as_deref().map(ConfigFile::load_from_file).transpose()?)
}
