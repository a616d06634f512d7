use apicache::api::{ApiClient, RequestOptions};
use apicache::clock;
use apicache::config::Config;
use apicache::logging;
use apicache::query::{QueryClient, QueryKey};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "apicache")]
#[command(about = "Cached access to a JSON API from the command line")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/apicache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// API origin, overriding the config file
  #[arg(long)]
  base_url: Option<String>,

  /// Keep the cache in memory for this run only
  #[arg(long)]
  no_persist: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read an endpoint through the cache
  Get {
    endpoint: String,
    /// Store the response for this long instead of the configured TTL
    #[arg(long)]
    ttl_secs: Option<u64>,
    /// Skip the cache lookup
    #[arg(long)]
    force: bool,
  },
  /// Resolve a query through the memory and durable tiers
  Query {
    /// Query identity, e.g. `stats 42`
    #[arg(required = true)]
    segments: Vec<String>,
    /// Endpoint read when neither tier has the query
    #[arg(long)]
    endpoint: String,
  },
  /// POST a JSON body
  Post {
    endpoint: String,
    #[arg(long)]
    data: Option<String>,
  },
  /// PUT a JSON body
  Put {
    endpoint: String,
    #[arg(long)]
    data: Option<String>,
  },
  /// DELETE an endpoint
  Delete { endpoint: String },
  /// Drop the cached read for an endpoint
  Invalidate { endpoint: String },
  /// Drop every cached entry
  Clear,
  /// Show the cached entry for an endpoint, if live
  Inspect { endpoint: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override base URL if specified on command line
  let config = if let Some(base_url) = args.base_url {
    let mut config = config;
    config.api.base_url = base_url;
    config
  } else {
    config
  };

  let _guard = logging::init(&config.log)?;
  info!(base_url = %config.api.base_url, persist = !args.no_persist, "Starting");

  let api = ApiClient::from_config(&config, !args.no_persist)?;

  match args.command {
    Command::Get {
      endpoint,
      ttl_secs,
      force,
    } => {
      let mut options = RequestOptions::new();
      if let Some(secs) = ttl_secs {
        options = options.with_ttl(Duration::from_secs(secs));
      }
      if force {
        options = options.force_refresh();
      }
      let value: Value = api.read(&endpoint, &options).await?;
      print_json(&value)?;
    }
    Command::Query { segments, endpoint } => {
      run_query(&api, &config, segments, endpoint).await?;
    }
    Command::Post { endpoint, data } => {
      let body = parse_body(data.as_deref())?;
      let value: Value = api.create(&endpoint, &body, &RequestOptions::new()).await?;
      api.invalidate(&endpoint, &RequestOptions::new());
      print_json(&value)?;
    }
    Command::Put { endpoint, data } => {
      let body = parse_body(data.as_deref())?;
      let value: Value = api.replace(&endpoint, &body, &RequestOptions::new()).await?;
      api.invalidate(&endpoint, &RequestOptions::new());
      print_json(&value)?;
    }
    Command::Delete { endpoint } => {
      let value: Value = api.remove(&endpoint, &RequestOptions::new()).await?;
      api.invalidate(&endpoint, &RequestOptions::new());
      print_json(&value)?;
    }
    Command::Invalidate { endpoint } => {
      api.invalidate(&endpoint, &RequestOptions::new());
      info!(endpoint = %endpoint, "Invalidated");
    }
    Command::Clear => {
      api.invalidate_all();
      info!(namespace = api.store().namespace(), "Cleared cache");
    }
    Command::Inspect { endpoint } => {
      let options = RequestOptions::new();
      let key = api.read_key(&endpoint, &options);
      match api.cached_entry(&endpoint, &options) {
        Some(entry) => {
          println!("key:        {}", key);
          println!("stored_at:  {}", clock::to_datetime(entry.stored_at).to_rfc3339());
          println!("expires_at: {}", clock::to_datetime(entry.expires_at).to_rfc3339());
          print_json(&entry.data)?;
        }
        None => println!("{}: not cached", key),
      }
    }
  }

  Ok(())
}

async fn run_query(
  api: &ApiClient,
  config: &Config,
  segments: Vec<String>,
  endpoint: String,
) -> Result<()> {
  let queries = QueryClient::new(api.store().clone())
    .with_defaults(config.query.options())
    .with_coalesce_window(config.cache.coalesce_window());
  let key = QueryKey::new(segments);

  let reader = api.clone();
  let result = queries
    .fetch_query(&key, &queries.defaults(), move || {
      let api = reader.clone();
      let endpoint = endpoint.clone();
      async move { api.read::<Value>(&endpoint, &RequestOptions::new()).await }
    })
    .await?;

  println!("source:     {:?}", result.source);
  println!("updated_at: {}", result.updated_at.to_rfc3339());
  print_json(&result.data)?;

  // Let the refresh land in the store before the process exits
  if let Some(refresh) = result.refresh {
    match refresh.await {
      Ok(Ok(_)) => info!(query = %key, "Refreshed in background"),
      Ok(Err(e)) => info!(query = %key, error = %e, "Background refresh failed"),
      Err(e) => return Err(eyre!("Refresh task failed: {}", e)),
    }
  }

  Ok(())
}

fn parse_body(data: Option<&str>) -> Result<Value> {
  match data {
    Some(raw) => {
      serde_json::from_str(raw).map_err(|e| eyre!("Failed to parse --data as JSON: {}", e))
    }
    None => Ok(Value::Null),
  }
}

fn print_json(value: &Value) -> Result<()> {
  let rendered =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to render response: {}", e))?;
  println!("{}", rendered);
  Ok(())
}
