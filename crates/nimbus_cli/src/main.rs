//! Nimbus CLI
//!
//! Command-line tools for inspecting a Nimbus backend.
//!
//! # Commands
//!
//! - `query` - Run a query and print the matching records
//! - `get` - Fetch one record by object id
//! - `count` - Count matching records
//! - `distinct` - List the distinct values of a key
//! - `delete` - Delete one record

mod commands;

use clap::{Parser, Subcommand};
use commands::output::Format;
use commands::transport::ReqwestClient;
use nimbus_client::{Client, ClientConfig, HttpTransport};
use tracing_subscriber::EnvFilter;

/// Nimbus command-line tools.
#[derive(Parser)]
#[command(name = "nimbus")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Base URL of the REST API
    #[arg(global = true, long, env = "NIMBUS_SERVER_URL")]
    server_url: Option<String>,

    /// Application id
    #[arg(global = true, long, env = "NIMBUS_APP_ID")]
    app_id: Option<String>,

    /// REST API key
    #[arg(global = true, long, env = "NIMBUS_REST_KEY", hide_env_values = true)]
    rest_key: Option<String>,

    /// Session token of the signed-in user
    #[arg(global = true, long, env = "NIMBUS_SESSION_TOKEN", hide_env_values = true)]
    session_token: Option<String>,

    /// Request timeout in seconds
    #[arg(global = true, long, default_value = "30")]
    timeout: u64,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a query and print the matching records
    Query {
        /// Class to query
        class: String,

        /// Constraints as a JSON `where` object
        #[arg(short, long)]
        r#where: Option<String>,

        /// Sort keys, comma separated; prefix with `-` for descending
        #[arg(short, long)]
        order: Option<String>,

        /// Maximum number of records
        #[arg(short, long)]
        limit: Option<i64>,

        /// Number of records to skip
        #[arg(short, long)]
        skip: Option<i64>,

        /// Keys to return, comma separated
        #[arg(short, long)]
        keys: Option<String>,

        /// Pointer keys to include in full, comma separated
        #[arg(short, long)]
        include: Option<String>,

        /// Walk every matching record page by page
        #[arg(long, conflicts_with_all = ["order", "skip"])]
        all: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: Format,
    },

    /// Fetch one record by object id
    Get {
        /// Class of the record
        class: String,

        /// Object id
        id: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "json")]
        format: Format,
    },

    /// Count matching records
    Count {
        /// Class to count
        class: String,

        /// Constraints as a JSON `where` object
        #[arg(short, long)]
        r#where: Option<String>,
    },

    /// List the distinct values of a key
    Distinct {
        /// Class to query
        class: String,

        /// Key whose values are listed
        key: String,

        /// Constraints as a JSON `where` object
        #[arg(short, long)]
        r#where: Option<String>,
    },

    /// Delete one record
    Delete {
        /// Class of the record
        class: String,

        /// Object id
        id: String,
    },

    /// Show version information
    Version,
}

impl Cli {
    fn client(&self) -> Result<Client, Box<dyn std::error::Error>> {
        let server_url = self
            .server_url
            .clone()
            .ok_or("Server URL required (--server-url or NIMBUS_SERVER_URL)")?;
        let app_id = self
            .app_id
            .clone()
            .ok_or("Application id required (--app-id or NIMBUS_APP_ID)")?;

        let mut config = ClientConfig::new(app_id, server_url)
            .with_timeout(std::time::Duration::from_secs(self.timeout));
        if let Some(key) = &self.rest_key {
            config = config.with_rest_key(key.clone());
        }
        if let Some(token) = &self.session_token {
            config = config.with_session_token(token.clone());
        }
        let transport = HttpTransport::new(config.clone(), ReqwestClient::new()?);
        Ok(Client::new(config, transport))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Version = cli.command {
        println!("Nimbus CLI v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    let client = cli.client()?;

    match cli.command {
        Commands::Query {
            class,
            r#where,
            order,
            limit,
            skip,
            keys,
            include,
            all,
            format,
        } => {
            let options = commands::query::QueryOptions {
                r#where,
                order,
                limit,
                skip,
                keys,
                include,
            };
            let query = commands::query::build(&client, &class, &options)?;
            if all {
                commands::query::walk(&query, format).await?;
            } else {
                commands::query::run(&query, format).await?;
            }
        }
        Commands::Get { class, id, format } => {
            commands::object::get(&client, &class, &id, format).await?;
        }
        Commands::Count { class, r#where } => {
            let query = commands::query::filtered(&client, &class, r#where.as_deref())?;
            println!("{}", query.count().await?);
        }
        Commands::Distinct {
            class,
            key,
            r#where,
        } => {
            let query = commands::query::filtered(&client, &class, r#where.as_deref())?;
            commands::query::distinct(&query, &key).await?;
        }
        Commands::Delete { class, id } => {
            commands::object::delete(&client, &class, &id).await?;
        }
        Commands::Version => {}
    }

    Ok(())
}
