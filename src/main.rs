//! Checks that an encryption setup is usable: loads the configuration,
//! makes sure the marking helper answers, and resolves on-demand KMS
//! credentials.

use std::process::ExitCode;

use field_crypt::config::Config;
use field_crypt::credentials::KmsCredentials;
use field_crypt::helper::HelperManager;
use field_crypt::logging::initialize_logger;

include!(concat!(env!("OUT_DIR"), "/version.rs"));

#[tokio::main]
async fn main() -> ExitCode {
    initialize_logger();
    tracing::info!(version = VERSION, "field-crypt diagnostics");

    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::FAILURE;
        }
    };
    tracing::debug!(?config, "configuration loaded");

    let options = match config.auto_encryption_options() {
        Ok(options) => options,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut healthy = true;

    if options.bypass_auto_encryption || options.bypass_query_analysis {
        println!("helper: not needed");
    } else {
        match HelperManager::with_tcp_probe(options.helper.clone()) {
            Ok(helper) => {
                match helper.ensure_running().await {
                    Ok(()) => println!("helper: {:?} at {}", helper.state(), options.helper.uri),
                    Err(err) => {
                        healthy = false;
                        println!("helper: {err}");
                    }
                }
                helper.shutdown().await;
            }
            Err(err) => {
                healthy = false;
                println!("helper: {err}");
            }
        }
    }

    let providers = options.encryption.kms_providers.clone();
    let names: Vec<&str> = providers.names().collect();
    println!("kms providers: {}", names.join(", "));
    match KmsCredentials::new(providers.clone(), options.encryption.credential_timeout) {
        Ok(credentials) if credentials.has_auto_providers() => match credentials.refresh().await {
            Ok(resolved) => {
                let names: Vec<&str> = resolved.keys().map(String::as_str).collect();
                println!("credentials: resolved for {}", names.join(", "));
            }
            Err(err) => {
                healthy = false;
                println!("credentials: {err}");
            }
        },
        Ok(_) => println!("credentials: all static"),
        Err(err) => {
            healthy = false;
            println!("credentials: {err}");
        }
    }

    if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
