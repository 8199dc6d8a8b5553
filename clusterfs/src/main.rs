use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use clusterfs::cli::{Cli, Commands, InitSchemaArgs, MountArgs};
use clusterfs::fuse::FuseAdapter;
use clusterfs::fuse::mount::mount_unprivileged;
use clusterfs::store::Store;
use clusterfs::store::etcd::EtcdBackend;
use clusterfs::vfs::Vfs;

fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let result = match cli.command {
        Commands::Mount(args) => mount(args).await,
        Commands::InitSchema(args) => init_schema(args).await,
    };
    if let Err(e) = &result {
        error!("{e:#}");
    }
    result
}

async fn mount(args: MountArgs) -> anyhow::Result<()> {
    let config = args.store_config()?;
    let options = args.mount_options()?;
    let store = Arc::new(
        Store::init(&config)
            .await
            .context("failed to open the filesystem store")?,
    );
    let janitor = store.spawn_cache_janitor(config.cache_ttl);
    let vfs = Vfs::new(store.clone(), options);
    let adapter = FuseAdapter::new(vfs, options);

    info!(
        mount_point = %args.mount.display(),
        keyspace = %config.keyspace,
        environment = %config.environment,
        owner = config.owner_id,
        "mounting clusterfs, press Ctrl+C to unmount"
    );
    let handle = mount_unprivileged(adapter, &args.mount)
        .await
        .with_context(|| format!("mount on {} failed", args.mount.display()))?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("signal error: {e}");
    }

    info!("unmounting");
    if let Err(e) = handle.unmount().await {
        warn!("unmount error: {e}");
    }
    if let Some(janitor) = janitor {
        janitor.abort();
    }
    match Arc::try_unwrap(store) {
        Ok(store) => store.shutdown(),
        Err(_) => debug!("store still shared by the session, released on drop"),
    }
    Ok(())
}

async fn init_schema(args: InitSchemaArgs) -> anyhow::Result<()> {
    let config = args.store.store_config()?;
    let backend = EtcdBackend::connect(&config)
        .await
        .with_context(|| format!("cannot reach cluster {:?}", config.endpoints))?;
    if Store::provision(&backend, &config.keyspace, args.block_size).await? {
        info!(keyspace = %config.keyspace, block_size = args.block_size, "keyspace provisioned");
    } else {
        info!(keyspace = %config.keyspace, "keyspace already provisioned");
    }
    Ok(())
}
