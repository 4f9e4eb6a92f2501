//! Node binary

use anyhow::Context;
use clap::{Parser, Subcommand};
use meshsearch::common::utils::format_heartbeat;
use meshsearch::coordinator::{IndexMapping, MetadataStore, NodeDirectory, NodeKey};
use meshsearch::{Config, MemoryShardEngine, NodeServer};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "meshsearch-node")]
#[command(about = "meshsearch cluster node")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "meshsearch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start one or more nodes sharing this process's directory
    Serve {
        /// Advertised server address
        #[arg(long)]
        address: Option<String>,

        /// RPC ports, one node per port (comma-separated)
        #[arg(long, value_delimiter = ',')]
        port: Vec<u16>,

        /// Directory database path
        #[arg(long)]
        directory: Option<PathBuf>,

        /// Create this index over the started nodes if it does not exist
        #[arg(long)]
        create_index: Option<String>,

        /// Number of shards of the created index
        #[arg(long, default_value = "4")]
        shards: u32,

        /// Replicas per shard of the created index
        #[arg(long, default_value = "1")]
        replicas: usize,
    },

    /// Show registered nodes and index mappings
    Status {
        /// Directory database path
        #[arg(long)]
        directory: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // File first, environment next, CLI flags last
    let mut config = Config::load(Some(cli.config.as_path())).context("loading configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve {
            address,
            port,
            directory,
            create_index,
            shards,
            replicas,
        } => {
            tracing::info!("Starting meshsearch {}", meshsearch::BUILD_INFO);
            if let Some(address) = address {
                config.node.server_address = address;
            }
            if let Some(directory) = directory {
                config.directory.db_path = directory;
            }
            let ports = if port.is_empty() {
                vec![config.node.rpc_port]
            } else {
                port
            };

            let store = Arc::new(
                MetadataStore::open(&config.directory.db_path)
                    .with_context(|| format!("opening directory {}", config.directory.db_path.display()))?,
            );
            let directory: Arc<dyn NodeDirectory> = store.clone();

            let mut pending = Vec::new();
            for port in ports {
                let mut node_config = config.clone();
                node_config.node.rpc_port = port;
                let server = NodeServer::new(node_config, directory.clone(), Arc::new(MemoryShardEngine::new()));
                let listener = server.bind().await?;
                let key = NodeKey::new(config.node.server_address.clone(), listener.local_addr()?.port());
                pending.push((server, listener, key));
            }

            if let Some(index_name) = create_index {
                if directory.get_index_mapping(&index_name).await?.is_some() {
                    tracing::warn!("Index {} already exists, keeping its mapping", index_name);
                } else {
                    let keys: Vec<NodeKey> = pending.iter().map(|(_, _, key)| key.clone()).collect();
                    let mapping = IndexMapping::spread(index_name.clone(), shards, &keys, replicas)?;
                    directory.put_index_mapping(mapping).await?;
                    tracing::info!(
                        "Created index {} ({} shards, {} replicas over {} nodes)",
                        index_name,
                        shards,
                        replicas,
                        keys.len()
                    );
                }
            }

            let mut handles = Vec::new();
            for (server, listener, _) in pending {
                handles.push(server.start(listener).await?);
            }

            tokio::signal::ctrl_c().await?;
            for handle in handles {
                if let Err(e) = handle.shutdown().await {
                    tracing::error!("Node shutdown failed: {}", e);
                }
            }
            store.flush()?;
        }

        Commands::Status { directory } => {
            let path = directory.unwrap_or(config.directory.db_path);
            let store = MetadataStore::open(&path)
                .with_context(|| format!("opening directory {}", path.display()))?;

            println!("Nodes:");
            for node in store.list_nodes()? {
                println!(
                    "  {} (version {}, last heartbeat {})",
                    node.key(),
                    node.version,
                    format_heartbeat(node.heartbeat)
                );
            }
            println!("Indexes:");
            for mapping in store.list_indexes()? {
                println!("  {} ({} shards)", mapping.index_name, mapping.number_of_shards);
                for shard in &mapping.shard_mappings {
                    let replicas: Vec<String> = shard.replicas.iter().map(|r| r.to_string()).collect();
                    println!(
                        "    shard {}: master {}, replicas [{}]",
                        shard.shard_number,
                        shard.master,
                        replicas.join(", ")
                    );
                }
            }
        }
    }

    Ok(())
}
