use std::path::{Path, PathBuf};

use connectgate_proxy::ProxyConfig;
use connectgate_settings::{
    AuthSettings, ConfigLoader, ConnectgateConfig, DnsSettings, PolicySettings, ServerSettings,
    TunnelSettings,
};

use crate::cli::{ConfigArgs, ConfigSubcommand, OutputFormat};
use crate::commands::serve::DEFAULT_BIND_ADDR;
use crate::error::CliError;

pub fn config(args: ConfigArgs) -> Result<(), CliError> {
    match args.subcommand {
        ConfigSubcommand::Init { path } => init(path),
        ConfigSubcommand::Show { config, format } => show(config.as_deref(), format),
    }
}

fn init(path: Option<PathBuf>) -> Result<(), CliError> {
    let path = path.unwrap_or_else(ConfigLoader::global_config_path);

    if path.exists() {
        return Err(CliError::Other(format!(
            "Config file already exists: {}",
            path.display()
        )));
    }

    starter_config().save(&path)?;
    println!("Created config: {}", path.display());
    Ok(())
}

fn show(explicit: Option<&Path>, format: OutputFormat) -> Result<(), CliError> {
    let config = ConfigLoader::load(explicit)?.redacted();
    match format {
        OutputFormat::Toml => {
            let toml = config.to_toml()?;
            print!("{toml}");
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&config)
                .map_err(|e| CliError::Other(format!("JSON serialization failed: {e}")))?;
            println!("{json}");
        }
    }
    Ok(())
}

/// Every setting spelled out with its default, credentials and TLS left unset.
fn starter_config() -> ConnectgateConfig {
    let defaults = ProxyConfig::default();
    ConnectgateConfig {
        server: ServerSettings {
            bind_addr: Some(DEFAULT_BIND_ADDR.to_string()),
            proxy_agent: Some(defaults.tunnel.proxy_agent.clone()),
            ..Default::default()
        },
        auth: AuthSettings {
            realm: Some(defaults.realm.clone()),
            ..Default::default()
        },
        dns: DnsSettings {
            enabled: Some(defaults.resolver.enabled),
            doh_url: Some(defaults.resolver.doh_url.clone()),
            lookup_timeout_ms: Some(
                u64::try_from(defaults.resolver.lookup_timeout.as_millis()).unwrap_or(u64::MAX),
            ),
            cache_ttl_secs: Some(defaults.resolver.cache_ttl.as_secs()),
        },
        policy: PolicySettings {
            block_private: Some(defaults.block_private),
            max_tunnels_per_destination: Some(defaults.max_tunnels_per_destination),
        },
        tunnel: TunnelSettings {
            connect_timeout_secs: Some(defaults.tunnel.connect_timeout.as_secs()),
            idle_timeout_secs: Some(defaults.tunnel.idle_timeout.as_secs()),
        },
    }
}
