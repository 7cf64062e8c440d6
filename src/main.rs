use clap::{Parser, Subcommand};
use code_search_mcp::config::Config;
use code_search_mcp::mcp::run_mcp_server;
use code_search_mcp::model::{ContentType, SymbolKind};
use code_search_mcp::search::SearchOptions;
use code_search_mcp::server::Server;
use std::str::FromStr;

#[derive(Parser)]
#[command(name = "code-search")]
#[command(version = "0.2.0")]
#[command(about = "Hybrid (lexical + semantic) local code search with MCP support")]
struct Cli {
    /// Run in MCP (Model Context Protocol) server mode
    #[arg(long)]
    mcp: bool,

    /// Optional subcommand (if not using MCP mode)
    #[command(subcommand)]
    command: Option<Commands>,

    /// Direct query argument (fallback if no subcommand)
    #[arg(index = 1)]
    direct_query: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or resume a full index of the repository
    Index {
        /// Repository path
        #[arg(short, long, default_value = ".")]
        path: String,
    },
    /// Search the codebase
    Search {
        /// Search query
        query: String,

        /// Repository path
        #[arg(short, long, default_value = ".")]
        path: String,

        /// Limit results count
        #[arg(long)]
        limit: Option<usize>,

        /// Restrict results to a path prefix
        #[arg(long)]
        path_prefix: Option<String>,

        /// Restrict results to a content type (code, markdown, text, config, other)
        #[arg(long)]
        content_type: Option<String>,

        /// Restrict results to a language
        #[arg(long)]
        language: Option<String>,

        /// Restrict results to a symbol kind (function, method, class, ...)
        #[arg(long)]
        symbol_type: Option<String>,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("code_search_mcp=info".parse().unwrap()))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    if cli.mcp {
        run_mcp_server().await?;
        return Ok(());
    }

    let (query, path, limit, path_prefix, content_type, language, symbol_type, index_only) = match cli.command {
        Some(Commands::Index { path }) => (None, path, None, None, None, None, None, true),
        Some(Commands::Search { query, path, limit, path_prefix, content_type, language, symbol_type }) => {
            (Some(query), path, limit, path_prefix, content_type, language, symbol_type, false)
        }
        None => match cli.direct_query {
            Some(q) => (Some(q), ".".to_string(), None, None, None, None, None, false),
            None => {
                use clap::CommandFactory;
                Cli::command().print_help()?;
                return Ok(());
            }
        },
    };

    let root = std::path::Path::new(&path).canonicalize()?;
    let mut server = Server::open(&root, Config::default())?;

    tracing::info!(path = %root.display(), "indexing repository");
    let summary = server.full_index().await?;
    tracing::info!(?summary, "indexing complete");

    if index_only {
        return Ok(());
    }

    server.start_watcher().ok();
    let _compactor = server.spawn_compactor();

    let query = query.expect("query is required outside index-only mode");
    let limit = limit.unwrap_or_else(|| {
        std::env::var("CODE_SEARCH_LIMIT").ok().and_then(|s| s.parse().ok()).unwrap_or(10)
    });

    let options = SearchOptions {
        limit,
        path_prefix,
        content_type: content_type.as_deref().and_then(|s| ContentType::from_str(s).ok()),
        language,
        symbol_type: symbol_type.as_deref().and_then(|s| SymbolKind::from_str(s).ok()),
        weights: None,
    };
    let results = server.search_engine.search(&query, options).await?;

    if results.is_empty() {
        println!("No results found.");
    } else {
        for (i, result) in results.iter().enumerate() {
            println!("\n{}. {}:{}-{} (score: {:.3})", i + 1, result.file_path, result.start_line, result.end_line, result.score);
            if !result.context.is_empty() {
                println!("// {}", result.context);
            }
            println!("--------------------------------------------------");
            println!("{}", result.raw_content);
            println!("--------------------------------------------------");
        }
    }

    Ok(())
}
