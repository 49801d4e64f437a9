use connectgate_proxy::{load_acceptor, DohClient};
use connectgate_settings::ConfigLoader;

use crate::cli::CheckArgs;
use crate::commands::serve::build_proxy_config;
use crate::error::CliError;

pub fn check(args: CheckArgs) -> Result<(), CliError> {
    let mut all_ok = true;

    // 1. Config files
    println!("Config files:");
    let global_path = ConfigLoader::global_config_path();
    let status = if global_path.exists() { "found" } else { "not found" };
    println!("  {} ({})", global_path.display(), status);
    if let Some(path) = &args.config {
        let status = if path.exists() { "found" } else { "not found" };
        println!("  {} ({})", path.display(), status);
    }

    // 2. Load + validate
    let settings = match ConfigLoader::load(args.config.as_deref()) {
        Ok(settings) => {
            println!("Config loaded: OK");
            settings
        }
        Err(e) => {
            println!("Config loaded: FAIL - {e}");
            return Err(CliError::Other("One or more checks failed".to_string()));
        }
    };
    let validated = settings
        .validate()
        .map_err(CliError::from)
        .and_then(|()| build_proxy_config(&settings));
    let config = match validated {
        Ok(config) => {
            println!("Config valid: OK");
            config
        }
        Err(e) => {
            println!("Config valid: FAIL - {e}");
            return Err(CliError::Other("One or more checks failed".to_string()));
        }
    };

    // 3. TLS material
    print!("TLS: ");
    match &config.tls {
        None => println!("disabled (plaintext listener)"),
        Some(files) => match load_acceptor(files) {
            Ok(_) => println!("OK ({})", files.cert_path.display()),
            Err(e) => {
                println!("FAIL - {e}");
                all_ok = false;
            }
        },
    }

    // 4. DoH endpoint
    print!("DoH endpoint: ");
    if !config.resolver.enabled {
        println!("disabled (hostnames passed through)");
    } else {
        match DohClient::new(&config.resolver.doh_url) {
            Ok(client) => println!("OK ({})", client.endpoint()),
            Err(e) => {
                println!("FAIL - {e}");
                all_ok = false;
            }
        }
    }

    // 5. Effective policy
    println!("Listen address: {}", config.bind_addr);
    println!(
        "Authentication: {}",
        if config.credentials.is_some() { "required" } else { "open" }
    );
    println!(
        "Block private destinations: {}",
        if config.block_private { "yes" } else { "NO" }
    );
    println!(
        "Max tunnels per destination: {}",
        config.max_tunnels_per_destination
    );

    if !all_ok {
        return Err(CliError::Other("One or more checks failed".to_string()));
    }

    Ok(())
}
