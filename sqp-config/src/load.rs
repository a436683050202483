use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::Environment;

/// Directory, relative to the working directory, holding the configuration files.
const CONFIGURATION_DIR: &str = "configuration";

/// Overrides [`CONFIGURATION_DIR`] when set.
const CONFIGURATION_DIR_ENV_NAME: &str = "APP_CONFIGURATION_DIR";

/// Extensions tried, in order, for every configuration file stem.
const CONFIG_FILE_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Prefix for environment variable overrides, e.g. `APP_PIPELINE__MAX_RETRIES`.
const ENV_PREFIX: &str = "APP";
const ENV_PREFIX_SEPARATOR: &str = "_";
const ENV_SEPARATOR: &str = "__";
const LIST_SEPARATOR: &str = ",";

/// Implemented by top-level configuration structures loaded through [`load_config`].
pub trait Config {
    /// Keys whose environment variable values are split on `,` into lists.
    const LIST_PARSE_KEYS: &'static [&'static str];
}

/// Errors raised while assembling configuration from files and the environment.
#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("failed to determine the current directory: {0}")]
    CurrentDir(#[source] io::Error),

    #[error("configuration directory `{0}` does not exist")]
    MissingConfigurationDirectory(PathBuf),

    #[error("could not locate the base configuration in `{directory}`; attempted: {attempted}")]
    BaseFileMissing { directory: PathBuf, attempted: String },

    #[error("failed to load configuration file `{path}`: {source}")]
    FileLoad {
        path: PathBuf,
        #[source]
        source: config::ConfigError,
    },

    #[error("failed to determine runtime environment: {0}")]
    Environment(#[source] io::Error),

    #[error("failed to build configuration: {0}")]
    Build(#[source] config::ConfigError),

    #[error("failed to deserialize configuration: {0}")]
    Deserialization(#[source] config::ConfigError),
}

/// Loads configuration for the current runtime environment.
///
/// Sources are layered in order: `base.(yaml|yml|json)`, the optional
/// `{environment}.(yaml|yml|json)` and finally `APP_`-prefixed environment variables with `__`
/// separating nested keys.
pub fn load_config<T>() -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    let directory = match std::env::var(CONFIGURATION_DIR_ENV_NAME) {
        Ok(directory) => PathBuf::from(directory),
        Err(_) => std::env::current_dir()
            .map_err(LoadConfigError::CurrentDir)?
            .join(CONFIGURATION_DIR),
    };
    let environment = Environment::load().map_err(LoadConfigError::Environment)?;

    load_config_from(&directory, environment)
}

/// Loads configuration from an explicit directory and environment.
pub fn load_config_from<T>(directory: &Path, environment: Environment) -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    if !directory.is_dir() {
        return Err(LoadConfigError::MissingConfigurationDirectory(
            directory.to_path_buf(),
        ));
    }

    let base_file = match find_configuration_file(directory, "base") {
        Some(path) => path,
        None => {
            return Err(LoadConfigError::BaseFileMissing {
                directory: directory.to_path_buf(),
                attempted: attempted_paths(directory, "base"),
            });
        }
    };

    let mut builder = config::Config::builder();
    builder = add_file(builder, &base_file)?;

    if let Some(environment_file) = find_configuration_file(directory, environment.as_str()) {
        builder = add_file(builder, &environment_file)?;
    }

    let mut environment_source = config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_PREFIX_SEPARATOR)
        .separator(ENV_SEPARATOR);

    if !T::LIST_PARSE_KEYS.is_empty() {
        environment_source = environment_source
            .try_parsing(true)
            .list_separator(LIST_SEPARATOR);

        for key in T::LIST_PARSE_KEYS {
            environment_source = environment_source.with_list_parse_key(key);
        }
    }

    builder
        .add_source(environment_source)
        .build()
        .map_err(LoadConfigError::Build)?
        .try_deserialize::<T>()
        .map_err(LoadConfigError::Deserialization)
}

/// Adds a file source and eagerly parses it so that errors point at the offending file.
fn add_file(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
    path: &Path,
) -> Result<config::ConfigBuilder<config::builder::DefaultState>, LoadConfigError> {
    let builder = builder.add_source(config::File::from(path.to_path_buf()));
    builder
        .build_cloned()
        .map_err(|source| LoadConfigError::FileLoad {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(builder)
}

fn find_configuration_file(directory: &Path, stem: &str) -> Option<PathBuf> {
    CONFIG_FILE_EXTENSIONS
        .iter()
        .map(|extension| directory.join(format!("{stem}.{extension}")))
        .find(|path| path.is_file())
}

fn attempted_paths(directory: &Path, stem: &str) -> String {
    CONFIG_FILE_EXTENSIONS
        .iter()
        .map(|extension| format!("`{}`", directory.join(format!("{stem}.{extension}")).display()))
        .collect::<Vec<_>>()
        .join(", ")
}
