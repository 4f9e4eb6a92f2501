//! CLI for cluster operations

use anyhow::Context;
use clap::{Parser, Subcommand};
use meshsearch::common::utils::parse_duration;
use meshsearch::proto::search_node_client::SearchNodeClient;
use meshsearch::proto::*;
use meshsearch::Error;
use serde_json::{json, Value};
use tonic::transport::{Channel, Endpoint};

#[derive(Parser)]
#[command(name = "meshsearch")]
#[command(about = "meshsearch cluster CLI")]
#[command(version)]
struct Cli {
    /// Node to send requests to
    #[arg(long, default_value = "http://127.0.0.1:32191")]
    node: String,

    /// Request timeout (e.g. 500ms, 30s)
    #[arg(long, default_value = "30s")]
    timeout: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a JSON document
    Store {
        index: String,
        id: String,
        /// Document body; read from --file when omitted
        document: Option<String>,
        #[arg(long)]
        file: Option<std::path::PathBuf>,
    },

    /// Fetch a document
    Fetch {
        index: String,
        id: String,
        #[arg(long, default_value = "master-preferred")]
        policy: RoutingPolicy,
    },

    /// Delete a document
    Delete { index: String, id: String },

    /// Query an index
    Query {
        index: String,
        /// `*`, `field:value` or a bare term
        #[arg(default_value = "*")]
        query: String,
        #[arg(long, default_value = "0")]
        start: u32,
        #[arg(long, default_value = "10")]
        amount: u32,
        /// Sort field as `field[:asc|desc]`, repeatable
        #[arg(long)]
        sort: Vec<String>,
        /// Numeric statistic as `numeric_field[:facet_field]`, repeatable
        #[arg(long)]
        stat: Vec<String>,
        /// Quantile in [0, 1] reported for every statistic, repeatable
        #[arg(long)]
        percentile: Vec<f64>,
        /// Relative accuracy of percentile estimates
        #[arg(long, default_value = "0.001")]
        precision: f64,
        /// Count facet field, repeatable
        #[arg(long)]
        facet: Vec<String>,
        #[arg(long, default_value = "10")]
        max_facets: i32,
        /// Facets per shard (-1 for all)
        #[arg(long, default_value = "-1", allow_negative_numbers = true)]
        shard_facets: i32,
        #[arg(long, default_value = "master-preferred")]
        policy: RoutingPolicy,
        /// Include stored documents
        #[arg(long)]
        documents: bool,
    },

    /// Count documents per shard
    Count { index: String },

    /// List field names
    Fields {
        index: String,
        #[arg(long, default_value = "master-preferred")]
        policy: RoutingPolicy,
    },

    /// List terms of a field
    Terms {
        index: String,
        field: String,
        #[arg(long, default_value = "0")]
        amount: u32,
        #[arg(long, default_value = "0")]
        min_doc_freq: u64,
        #[arg(long, default_value = "master-preferred")]
        policy: RoutingPolicy,
    },

    /// Optimize every shard of an index
    Optimize { index: String },

    /// Remove every document of an index
    Clear { index: String },
}

fn parse_sort(arg: &str) -> anyhow::Result<FieldSort> {
    let (field, direction) = match arg.split_once(':') {
        Some((field, "asc")) => (field, Direction::Ascending),
        Some((field, "desc")) => (field, Direction::Descending),
        Some((_, other)) => anyhow::bail!("unknown sort direction: {}", other),
        None => (arg, Direction::Ascending),
    };
    Ok(FieldSort {
        field: field.to_string(),
        direction: direction as i32,
        missing_last: false,
    })
}

/// Decode stored JSON bytes for display.
fn document_json(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

fn print(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let timeout = parse_duration(&cli.timeout)?;
    let channel: Channel = Endpoint::from_shared(cli.node.clone())?
        .timeout(timeout)
        .connect()
        .await
        .with_context(|| format!("connecting to {}", cli.node))?;
    let mut client = SearchNodeClient::new(channel);
    let node = cli.node.clone();
    let failed = |status: tonic::Status| Error::from_status(&node, status);

    match cli.command {
        Commands::Store {
            index,
            id,
            document,
            file,
        } => {
            let document = match (document, file) {
                (Some(body), _) => body.into_bytes(),
                (None, Some(path)) => std::fs::read(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, None) => anyhow::bail!("pass a document or --file"),
            };
            let response = client
                .store(StoreRequest {
                    index_name: index,
                    unique_id: id,
                    document,
                })
                .await
                .map_err(failed)?
                .into_inner();
            print(&json!({ "replaced": response.replaced }))?;
        }

        Commands::Fetch { index, id, policy } => {
            let response = client
                .fetch(FetchRequest {
                    index_name: index,
                    unique_id: id,
                    routing_policy: policy as i32,
                })
                .await
                .map_err(failed)?
                .into_inner();
            print(&json!({
                "found": response.found,
                "document": document_json(&response.document),
            }))?;
        }

        Commands::Delete { index, id } => {
            let response = client
                .delete(DeleteRequest {
                    index_name: index,
                    unique_id: id,
                })
                .await
                .map_err(failed)?
                .into_inner();
            print(&json!({ "deleted": response.deleted }))?;
        }

        Commands::Query {
            index,
            query,
            start,
            amount,
            sort,
            stat,
            percentile,
            precision,
            facet,
            max_facets,
            shard_facets,
            policy,
            documents,
        } => {
            let sort = sort
                .iter()
                .map(|s| parse_sort(s))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let stat_requests = stat
                .iter()
                .map(|s| {
                    let (numeric_field, facet_field) = s.split_once(':').unwrap_or((s.as_str(), ""));
                    StatRequest {
                        numeric_field: numeric_field.to_string(),
                        facet_field: facet_field.to_string(),
                        shard_facets,
                        max_facets,
                        percentiles: percentile.clone(),
                        precision,
                    }
                })
                .collect();
            let count_requests = facet
                .into_iter()
                .map(|facet_field| CountRequest {
                    facet_field,
                    max_facets,
                    shard_facets,
                })
                .collect();

            let response = client
                .query(QueryRequest {
                    index_name: index,
                    query,
                    start,
                    amount,
                    sort,
                    stat_requests,
                    count_requests,
                    routing_policy: policy as i32,
                    fetch_documents: documents,
                })
                .await
                .map_err(failed)?
                .into_inner();

            let results: Vec<Value> = response
                .results
                .iter()
                .map(|r| {
                    json!({
                        "unique_id": r.unique_id,
                        "score": r.score,
                        "shard": r.shard,
                        "document": document_json(&r.document),
                    })
                })
                .collect();
            print(&json!({
                "total_hits": response.total_hits,
                "results": results,
                "stats": response.stat_groups,
                "facets": response.facet_groups,
            }))?;
        }

        Commands::Count { index } => {
            let response = client
                .get_number_of_docs(GetNumberOfDocsRequest { index_name: index })
                .await
                .map_err(failed)?
                .into_inner();
            print(&serde_json::to_value(&response)?)?;
        }

        Commands::Fields { index, policy } => {
            let response = client
                .get_field_names(GetFieldNamesRequest {
                    index_name: index,
                    routing_policy: policy as i32,
                })
                .await
                .map_err(failed)?
                .into_inner();
            print(&json!(response.field_names))?;
        }

        Commands::Terms {
            index,
            field,
            amount,
            min_doc_freq,
            policy,
        } => {
            let response = client
                .get_terms(GetTermsRequest {
                    index_name: index,
                    field,
                    amount,
                    min_doc_freq,
                    routing_policy: policy as i32,
                })
                .await
                .map_err(failed)?
                .into_inner();
            print(&serde_json::to_value(&response.terms)?)?;
        }

        Commands::Optimize { index } => {
            let response = client
                .optimize(OptimizeRequest { index_name: index })
                .await
                .map_err(failed)?
                .into_inner();
            print(&json!({ "shards_optimized": response.shards_optimized }))?;
        }

        Commands::Clear { index } => {
            let response = client
                .clear(ClearRequest { index_name: index })
                .await
                .map_err(failed)?
                .into_inner();
            print(&json!({ "shards_cleared": response.shards_cleared }))?;
        }
    }

    Ok(())
}
