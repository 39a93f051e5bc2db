//! CLI command implementations. Each builds an orchestrator from the
//! config, runs one operation, and prints a plain-text summary.

use std::path::Path;

use anyhow::{Context, Result};
use uuid::Uuid;

use memory_agent_core::filter::MetadataFilter;
use memory_agent_core::models::{
    Document, DocumentFormat, Metadata, MetadataValue, RequestedStrategy, RetrievalRequest,
};
use memory_agent_core::workflow::StoreReceipt;
use memory_agent_core::MemoryError;

use crate::app;
use crate::config::Config;

/// Arguments of `mem store`.
pub struct StoreArgs<'a> {
    pub file: &'a Path,
    pub format: Option<&'a str>,
    pub metadata: Vec<(String, MetadataValue)>,
    pub id: Option<String>,
    pub base_version: u64,
}

/// Arguments of `mem search`.
pub struct SearchArgs {
    pub query: String,
    pub strategy: Option<String>,
    pub filters: Vec<(String, MetadataValue)>,
    pub limit: Option<usize>,
    pub threshold: Option<f64>,
}

/// Format from `--format`, or from the file extension.
fn resolve_format(file: &Path, explicit: Option<&str>) -> Result<DocumentFormat, MemoryError> {
    match explicit {
        Some(raw) => raw.parse(),
        None => Ok(match file.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => DocumentFormat::Json,
            _ => DocumentFormat::Markdown,
        }),
    }
}

/// Read a document body, rejecting bytes that are not UTF-8.
fn read_content(file: &Path) -> Result<String> {
    let bytes = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let content = String::from_utf8(bytes).map_err(|_| {
        MemoryError::validation(format!("{} is not valid UTF-8", file.display()))
    })?;
    Ok(content)
}

fn print_receipt(action: &str, receipt: &StoreReceipt) {
    println!("{} {}", action, receipt.document_id);
    println!("  version: {}", receipt.version);
    println!("  chunks: {}", receipt.chunk_count);
    for warning in &receipt.warnings {
        println!("  warning: {}", warning);
    }
    println!("ok");
}

pub async fn run_store(config: &Config, args: StoreArgs<'_>) -> Result<()> {
    let format = resolve_format(args.file, args.format)?;
    let content = read_content(args.file)?;
    let metadata: Metadata = args.metadata.into_iter().collect();
    let id = args.id.unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut document = Document::new(id, content, format, metadata);
    document.version = args.base_version;

    let orchestrator = app::build(config).await?;
    let receipt = orchestrator.store_document(document).await?;
    print_receipt("stored", &receipt);
    Ok(())
}

pub async fn run_get(config: &Config, id: &str) -> Result<()> {
    let orchestrator = app::build(config).await?;
    let doc = orchestrator.retrieve_document(id).await?;
    let metadata = serde_json::to_string(&doc.metadata)?;

    println!("--- Document ---");
    println!("id:           {}", doc.id);
    println!("version:      {}", doc.version);
    println!("format:       {}", doc.format);
    println!("created_at:   {}", doc.created_at.to_rfc3339());
    println!("updated_at:   {}", doc.updated_at.to_rfc3339());
    println!("tokens:       {}", doc.token_count);
    println!("metadata:     {}", metadata);
    println!();
    println!("--- Content ---");
    println!("{}", doc.content);
    Ok(())
}

pub async fn run_search(config: &Config, args: SearchArgs) -> Result<()> {
    let strategy = match args.strategy.as_deref() {
        Some(raw) => raw.parse::<RequestedStrategy>()?,
        None => RequestedStrategy::Auto,
    };
    let filter = if args.filters.is_empty() {
        MetadataFilter::All
    } else {
        MetadataFilter::all_of(args.filters)
    };
    let request = RetrievalRequest {
        query: args.query,
        strategy,
        filter,
        limit: args.limit.unwrap_or(config.retrieval.limit),
        similarity_threshold: args.threshold,
    };

    let orchestrator = app::build(config).await?;
    let results = orchestrator.search_documents(request).await?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        let doc = &result.document;
        let excerpt: String = doc.content.chars().take(160).collect();
        println!("{}. [{:.2}] {} ({})", i + 1, result.score, doc.id, result.strategy);
        println!("    updated: {}", doc.updated_at.format("%Y-%m-%d"));
        println!("    version: {}", doc.version);
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        println!();
    }
    Ok(())
}

pub async fn run_delete(config: &Config, id: &str, version: u64) -> Result<()> {
    let orchestrator = app::build(config).await?;
    let receipt = orchestrator.delete_document(id, version).await?;
    print_receipt("deleted", &receipt);
    Ok(())
}

pub async fn run_purge(config: &Config, id: &str) -> Result<()> {
    let orchestrator = app::build(config).await?;
    let removed = orchestrator.purge_document(id).await?;
    println!("purged {}", id);
    println!("  objects removed: {}", removed);
    println!("ok");
    Ok(())
}

pub async fn run_reconcile(config: &Config) -> Result<()> {
    let orchestrator = app::build(config).await?;
    let report = orchestrator.reconcile().await?;
    println!("reconcile");
    println!("  documents scanned: {}", report.scanned);
    println!("  index entries repaired: {}", report.repaired.len());
    println!("  index entries removed: {}", report.removed.len());
    for err in &report.errors {
        println!("  error: {}", err);
    }
    println!("ok");
    Ok(())
}

pub async fn run_resume(config: &Config) -> Result<()> {
    let orchestrator = app::build(config).await?;
    let report = orchestrator.resume_incomplete().await?;
    println!("resume");
    println!("  completed: {}", report.completed.len());
    println!("  failed: {}", report.failed.len());
    for id in &report.failed {
        if let Some(exec) = orchestrator.execution(*id).await? {
            if let Some(failure) = exec.failure {
                println!("  {} {}: {}", id, exec.kind, failure);
            }
        }
    }
    println!("ok");
    Ok(())
}

pub async fn run_health(config: &Config) -> Result<()> {
    let orchestrator = app::build(config).await?;
    let report = orchestrator.health_check().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_format() {
        let json = Path::new("notes/config.JSON");
        let md = Path::new("notes/readme.md");
        assert_eq!(resolve_format(json, None).unwrap(), DocumentFormat::Json);
        assert_eq!(resolve_format(md, None).unwrap(), DocumentFormat::Markdown);
        assert_eq!(resolve_format(md, Some("json")).unwrap(), DocumentFormat::Json);
        assert!(resolve_format(md, Some("pdf")).is_err());
    }

    #[test]
    fn test_read_content_rejects_invalid_utf8() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.md");
        std::fs::write(&path, [0x66, 0x6f, 0xff, 0xfe]).unwrap();
        let err = read_content(&path).unwrap_err();
        assert!(err.to_string().contains("not valid UTF-8"));
    }
}
