use std::time::Duration;

use connectgate_proxy::{Credentials, ProxyConfig, ProxyServer, TlsFiles};
use connectgate_settings::{ConfigLoader, ConnectgateConfig};

use crate::cli::ServeArgs;
use crate::error::CliError;

/// Listen address when neither config nor environment sets one.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

pub async fn serve(args: ServeArgs) -> Result<(), CliError> {
    // 1. Load layered config: global file, --config, environment.
    let settings = ConfigLoader::load(args.config.as_deref())?;
    settings.validate()?;

    // 2. Translate to the proxy's config; --bind wins over everything.
    let mut config = build_proxy_config(&settings)?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    tracing::info!(
        doh_url = %config.resolver.doh_url,
        resolution = config.resolver.enabled,
        max_tunnels_per_destination = config.max_tunnels_per_destination,
        "starting connectgate"
    );

    // 3. Serve until Ctrl-C.
    let handle = ProxyServer::new(config)?.start().await?;
    eprintln!("connectgate: listening on {}", handle.local_addr());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    handle.shutdown().await?;
    Ok(())
}

/// Map merged settings onto the proxy's config, keeping library defaults for unset fields.
pub fn build_proxy_config(settings: &ConnectgateConfig) -> Result<ProxyConfig, CliError> {
    let bind = settings
        .server
        .bind_addr
        .as_deref()
        .unwrap_or(DEFAULT_BIND_ADDR);
    let mut config = ProxyConfig {
        bind_addr: bind
            .parse()
            .map_err(|e| CliError::Other(format!("Invalid bind address {bind:?}: {e}")))?,
        ..Default::default()
    };

    if let (Some(cert_path), Some(key_path)) =
        (&settings.server.tls_cert_path, &settings.server.tls_key_path)
    {
        config.tls = Some(TlsFiles {
            cert_path: cert_path.clone(),
            key_path: key_path.clone(),
        });
    }
    if let Some(agent) = &settings.server.proxy_agent {
        config.tunnel.proxy_agent = agent.clone();
    }

    if let (Some(username), Some(password)) = (&settings.auth.username, &settings.auth.password) {
        config.credentials = Some(Credentials::new(username.clone(), password.clone()));
    }
    if let Some(realm) = &settings.auth.realm {
        config.realm = realm.clone();
    }

    if let Some(enabled) = settings.dns.enabled {
        config.resolver.enabled = enabled;
    }
    if let Some(url) = &settings.dns.doh_url {
        config.resolver.doh_url = url.clone();
    }
    if let Some(timeout_ms) = settings.dns.lookup_timeout_ms {
        config.resolver.lookup_timeout = Duration::from_millis(timeout_ms);
    }
    if let Some(ttl) = settings.dns.cache_ttl_secs {
        config.resolver.cache_ttl = Duration::from_secs(ttl);
    }

    if let Some(block_private) = settings.policy.block_private {
        config.block_private = block_private;
    }
    if let Some(ceiling) = settings.policy.max_tunnels_per_destination {
        config.max_tunnels_per_destination = ceiling;
    }

    if let Some(connect_timeout) = settings.tunnel.connect_timeout_secs {
        config.tunnel.connect_timeout = Duration::from_secs(connect_timeout);
    }
    if let Some(idle_timeout) = settings.tunnel.idle_timeout_secs {
        config.tunnel.idle_timeout = Duration::from_secs(idle_timeout);
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_settings_use_defaults() {
        let config = build_proxy_config(&ConnectgateConfig::default()).unwrap();
        let defaults = ProxyConfig::default();
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR.parse::<std::net::SocketAddr>().unwrap());
        assert!(config.tls.is_none());
        assert!(config.credentials.is_none());
        assert_eq!(config.realm, defaults.realm);
        assert_eq!(config.resolver.doh_url, defaults.resolver.doh_url);
        assert_eq!(config.block_private, defaults.block_private);
        assert_eq!(
            config.max_tunnels_per_destination,
            defaults.max_tunnels_per_destination
        );
        assert_eq!(config.tunnel.idle_timeout, defaults.tunnel.idle_timeout);
    }

    #[test]
    fn test_settings_are_applied() {
        let settings = ConnectgateConfig::parse(
            r#"
            [server]
            bind_addr = "127.0.0.1:3128"
            tls_cert_path = "/c.pem"
            tls_key_path = "/k.pem"
            proxy_agent = "gate"

            [auth]
            username = "alice"
            password = "s3cret"
            realm = "corp"

            [dns]
            enabled = false
            lookup_timeout_ms = 250
            cache_ttl_secs = 5

            [policy]
            block_private = false
            max_tunnels_per_destination = 2

            [tunnel]
            connect_timeout_secs = 3
            idle_timeout_secs = 30
            "#,
        )
        .unwrap();

        let config = build_proxy_config(&settings).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:3128".parse::<std::net::SocketAddr>().unwrap());
        assert_eq!(
            config.tls,
            Some(TlsFiles {
                cert_path: "/c.pem".into(),
                key_path: "/k.pem".into(),
            })
        );
        assert_eq!(config.tunnel.proxy_agent, "gate");
        assert_eq!(
            config.credentials,
            Some(Credentials::new("alice", "s3cret"))
        );
        assert_eq!(config.realm, "corp");
        assert!(!config.resolver.enabled);
        assert_eq!(config.resolver.lookup_timeout, Duration::from_millis(250));
        assert_eq!(config.resolver.cache_ttl, Duration::from_secs(5));
        assert!(!config.block_private);
        assert_eq!(config.max_tunnels_per_destination, 2);
        assert_eq!(config.tunnel.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.tunnel.idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_bind_addr_rejected() {
        let settings = ConnectgateConfig::parse("[server]\nbind_addr = \"nope\"\n").unwrap();
        assert!(build_proxy_config(&settings).is_err());
    }
}
