//! crmsync-client - watch a collection from the command line
//!
//! Connects with the environment configuration (see [`SyncConfig::from_env`]),
//! fetches `<store>/<collection>` and prints the collection whenever a pushed
//! change alters it.

use anyhow::{bail, Context, Result};
use crmsync_client::shared::{FetchParams, ResourceKey};
use crmsync_client::{logging, SyncClient, SyncConfig};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(logging::DEFAULT_FILTER);

    let mut args = std::env::args().skip(1);
    let (Some(store), Some(collection)) = (args.next(), args.next()) else {
        bail!("usage: crmsync-client <store> <collection>");
    };

    let config = SyncConfig::from_env();
    let handshake_timeout = config.handshake_timeout;
    let client = SyncClient::from_config(config).context("invalid configuration")?;
    client
        .connection()
        .on_error(|e| crmsync_client::log_error!("{}", e))
        .detach();
    client.initialize();

    if let Err(e) = client
        .connection()
        .wait_until_authenticated(handshake_timeout)
        .await
    {
        crmsync_client::log_warn!("Not authenticated yet ({}); showing fetched data only", e);
    }

    let live = client.watch(ResourceKey::new(store, collection), "cli");
    let refresh = live.ensure_fresh(&FetchParams::new(), false).await;
    if let Some(e) = refresh.error {
        client.disconnect().await;
        return Err(e).context("initial fetch failed");
    }
    print_items(&live.items())?;

    let mut changes = live.changes();
    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                print_items(&live.items())?;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    drop(live);
    client.disconnect().await;
    Ok(())
}

fn print_items(items: &[crmsync_client::shared::Document]) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(items).context("serialize items")?);
    Ok(())
}
