// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use oppy_bridge::config::BridgeNodeConfig;
use oppy_bridge::keyring::PASSPHRASE_LEN;
use oppy_bridge::node::run_bridge_node;
use oppy_bridge_config::Config;
use std::io::Read;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
}

fn read_passphrase() -> anyhow::Result<Vec<u8>> {
    let mut buffer = [0u8; PASSPHRASE_LEN + 1];
    let n = std::io::stdin().read(&mut buffer)?;
    if n > PASSPHRASE_LEN {
        anyhow::bail!("the passcode is too long");
    }
    Ok(buffer[..n].to_vec())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = BridgeNodeConfig::load(&args.config_path)?;
    let passphrase = read_passphrase()?;

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_token.cancel();
        }
    });

    run_bridge_node(config, passphrase, cancel).await?;
    info!("we quit the bridge gracefully");
    Ok(())
}
