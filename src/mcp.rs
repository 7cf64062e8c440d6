//! MCP surface: exposes hybrid search as a tool over stdio. Grown from the
//! teacher's `McpServer` (same `rmcp` `tool_router`/`ServerHandler` pattern,
//! manual `call_tool` dispatch), rewired from the teacher's per-call
//! `Searcher` to the long-lived [`crate::server::Server`].

use anyhow::{Context, Result};
use rmcp::{
    model::{CallToolRequestParam, CallToolResult, Content, ErrorCode, ErrorData, ListToolsResult, PaginatedRequestParam},
    handler::server::{router::tool::ToolRouter, wrapper::Parameters, ServerHandler},
    service::{RequestContext, RoleServer, ServiceExt},
    tool, tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::model::{ContentType, SymbolKind};
use crate::search::SearchOptions;
use crate::server::Server;
use std::str::FromStr;

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug)]
pub struct SearchArgs {
    pub query: String,
    pub repository_path: Option<String>,
    pub limit: Option<usize>,
    pub path_prefix: Option<String>,
    pub content_type: Option<String>,
    pub language: Option<String>,
    pub symbol_type: Option<String>,
    pub weight_bm25: Option<f32>,
    pub weight_vector: Option<f32>,
}

/// Lazily opens a [`Server`] per repository path on first search against it
/// (model load is expensive; a bare `--mcp` launch shouldn't pay it).
#[derive(Clone)]
pub struct McpServer {
    tool_router: ToolRouter<Self>,
    servers: Arc<Mutex<std::collections::HashMap<PathBuf, Arc<Server>>>>,
}

#[tool_router]
impl McpServer {
    pub fn new() -> Self {
        Self {
            tool_router: Self::tool_router(),
            servers: Arc::new(Mutex::new(std::collections::HashMap::new())),
        }
    }

    async fn server_for(&self, path: &str) -> Result<Arc<Server>, ErrorData> {
        let root = PathBuf::from(path)
            .canonicalize()
            .map_err(|e| internal_error(format!("invalid repository path: {e}")))?;

        let mut servers = self.servers.lock().await;
        if let Some(server) = servers.get(&root) {
            return Ok(server.clone());
        }

        let server = Arc::new(
            tokio::task::spawn_blocking({
                let root = root.clone();
                move || Server::open(&root, Config::default())
            })
            .await
            .map_err(|e| internal_error(format!("server init task panicked: {e}")))?
            .map_err(|e| internal_error(e.user_message()))?,
        );
        servers.insert(root, server.clone());
        Ok(server)
    }

    #[tool(
        name = "search",
        description = "Perform a hybrid (lexical + semantic) code search. Returns relevant code chunks with file path, line numbers, and fused relevance score."
    )]
    async fn search(&self, args: Parameters<SearchArgs>) -> Result<CallToolResult, ErrorData> {
        let args = args.0;
        let path = args.repository_path.as_deref().unwrap_or(".");
        let server = self.server_for(path).await?;

        let limit = args.limit.unwrap_or_else(|| {
            std::env::var("CODE_SEARCH_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10)
        });

        let weights = match (args.weight_bm25, args.weight_vector) {
            (Some(b), Some(v)) => Some((b, v)),
            _ => None,
        };
        let options = SearchOptions {
            limit,
            path_prefix: args.path_prefix,
            content_type: args.content_type.as_deref().and_then(|s| ContentType::from_str(s).ok()),
            language: args.language,
            symbol_type: args.symbol_type.as_deref().and_then(|s| SymbolKind::from_str(s).ok()),
            weights,
        };

        let results = server
            .search_engine
            .search(&args.query, options)
            .await
            .map_err(|e| internal_error(e.user_message()))?;

        Ok(CallToolResult::success(vec![Content::text(format_results(&results))]))
    }
}

fn format_results(results: &[crate::search::SearchResult]) -> String {
    if results.is_empty() {
        return "No results found.".to_string();
    }
    let mut out = String::new();
    for result in results {
        out.push_str(&format!(
            "{}:{}-{} (score: {:.3})\n",
            result.file_path, result.start_line, result.end_line, result.score
        ));
        if !result.context.is_empty() {
            out.push_str(&format!("// {}\n", result.context));
        }
        out.push_str("--------------------------------------------------\n");
        out.push_str(&result.raw_content);
        out.push_str("\n--------------------------------------------------\n\n");
    }
    out
}

fn internal_error(message: String) -> ErrorData {
    ErrorData { code: ErrorCode(-32000), message: message.into(), data: None }
}

impl ServerHandler for McpServer {
    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _ctx: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        Ok(ListToolsResult { tools: self.tool_router.list_all(), next_cursor: None, meta: None })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        if request.name == "search" {
            let args: SearchArgs = if let Some(args_map) = request.arguments {
                serde_json::from_value(serde_json::Value::Object(args_map))
                    .map_err(|e| ErrorData { code: ErrorCode(-32602), message: format!("Invalid arguments: {e}").into(), data: None })?
            } else {
                return Err(ErrorData { code: ErrorCode(-32602), message: "Missing arguments".into(), data: None });
            };
            return self.search(Parameters(args)).await;
        }

        Err(ErrorData { code: ErrorCode(-32601), message: format!("Tool not found: {}", request.name).into(), data: None })
    }
}

pub async fn run_mcp_server() -> Result<()> {
    let server = McpServer::new();
    let transport = rmcp::transport::io::stdio();
    server.serve(transport).await.context("MCP server failed")?;
    Ok(())
}
