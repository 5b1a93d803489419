//! Layered configuration: file, then `TURBOSTREAM__*` environment, then flags.

use std::path::Path;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use turbostream_transport::{ReconnectConfig, TransportConfig};

use crate::cli::ConnectionArgs;
use crate::error::{CliError, CliResult};

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "TURBOSTREAM";

/// Separator between nested keys, e.g. `TURBOSTREAM__BUFFER__MAX_SIZE`.
pub const ENV_SEPARATOR: &str = "__";

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}

fn layered(builder: ConfigBuilder<DefaultState>, env: Environment) -> CliResult<TransportConfig> {
    let config = builder.add_source(env).build()?;
    Ok(config.try_deserialize()?)
}

/// Loads the file at `path` (if any) layered with the environment.
pub fn load(path: Option<&Path>) -> CliResult<TransportConfig> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(File::from(path));
    }
    layered(builder, environment())
}

/// Applies command-line overrides on top of loaded settings.
pub fn apply(mut config: TransportConfig, args: &ConnectionArgs) -> TransportConfig {
    if let Some(endpoint) = &args.endpoint {
        config.endpoint.clone_from(endpoint);
    }
    for (name, value) in &args.headers {
        config.headers.insert(name.clone(), value.clone());
    }
    if args.no_reconnect {
        config.reconnect = ReconnectConfig {
            enabled: false,
            ..config.reconnect
        };
    }
    config.debug |= args.debug;
    config
}

/// A stream needs somewhere to connect; reported as a usage error.
fn require_endpoint(config: &TransportConfig) -> CliResult<()> {
    if config.endpoint.trim().is_empty() {
        return Err(CliError::InvalidArguments(
            "no endpoint given (--endpoint, TURBOSTREAM_ENDPOINT or the config file)".to_string(),
        ));
    }
    Ok(())
}

/// Loads, overrides and validates the effective configuration.
pub fn resolve(args: &ConnectionArgs) -> CliResult<TransportConfig> {
    let config = apply(load(args.config.as_deref())?, args);
    require_endpoint(&config)?;
    config.validate()?;
    Ok(config)
}
