//! CLI `kb` commands: load reference documents and query them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};

use crate::assistant::knowledge::{self, RetrievalParams};
use crate::config::MediConfig;
use crate::db;
use crate::embedding::{self, EmbeddingProvider};

const DOCUMENT_EXTENSIONS: [&str; 4] = ["txt", "md", "markdown", "pdf"];

fn is_document(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| DOCUMENT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"))
}

/// Plain text of a document; PDFs go through text extraction.
fn read_document(path: &Path) -> Result<String> {
    if is_pdf(path) {
        pdf_extract::extract_text(path)
            .map_err(|e| anyhow!("{e}"))
            .with_context(|| format!("failed to extract text from {}", path.display()))
    } else {
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
    }
}

/// Expand directories (one level) into their documents.
fn collect_documents(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut docs = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(path)
                .with_context(|| format!("failed to read directory: {}", path.display()))?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_document(p))
                .collect();
            entries.sort();
            docs.extend(entries);
        } else {
            docs.push(path.clone());
        }
    }
    Ok(docs)
}

fn source_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Split, embed, and store each document. Re-ingesting a file replaces it.
pub async fn ingest(config: &MediConfig, paths: &[PathBuf]) -> Result<()> {
    let docs = collect_documents(paths)?;
    if docs.is_empty() {
        println!("No documents to ingest.");
        return Ok(());
    }

    let mut conn = db::open_database(config.resolved_db_path()).context("failed to open database")?;
    let provider: Arc<dyn EmbeddingProvider> = Arc::from(
        embedding::create_provider(&config.embedding).context("failed to create embedding provider")?,
    );

    println!("Ingesting {} document(s) with '{}'...", docs.len(), provider.model_name());
    let pb = ProgressBar::new(docs.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {bar:40.cyan/blue} {pos}/{len} {msg}")
            .context("invalid progress template")?
            .progress_chars("##-"),
    );

    let mut total_chunks = 0;
    for path in &docs {
        let source = source_name(path);
        pb.set_message(source.clone());
        let text = read_document(path)?;

        let chunks = knowledge::split_text(&text, config.assistant.chunk_size, config.assistant.chunk_overlap);
        let texts = chunks.clone();
        let ep = Arc::clone(&provider);
        let embeddings = tokio::task::spawn_blocking(move || {
            let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
            ep.embed_batch(&refs)
        })
        .await?
        .with_context(|| format!("failed to embed {source}"))?;

        let now = chrono::Local::now().naive_local();
        total_chunks += knowledge::store_chunks(&mut conn, &source, &chunks, &embeddings, now)?;
        pb.inc(1);
    }
    pb.finish_and_clear();

    db::migrations::set_embedding_model(&conn, provider.model_name())?;
    println!("Stored {total_chunks} chunk(s) from {} document(s).", docs.len());
    Ok(())
}

/// Drop every chunk of `source`.
pub fn remove(config: &MediConfig, source: &str) -> Result<()> {
    let conn = db::open_database(config.resolved_db_path())?;
    let removed = knowledge::remove_source(&conn, source)?;
    if removed == 0 {
        println!("No chunks found for '{source}'.");
    } else {
        println!("Removed {removed} chunk(s) of '{source}'.");
    }
    Ok(())
}

/// Show the passages the assistant would use for `query`.
pub async fn search(config: &MediConfig, query: &str) -> Result<()> {
    let conn = db::open_database(config.resolved_db_path())?;
    let provider: Arc<dyn EmbeddingProvider> = Arc::from(embedding::create_provider(&config.embedding)?);

    let query_text = query.to_string();
    let ep = Arc::clone(&provider);
    let query_embedding = tokio::task::spawn_blocking(move || ep.embed(&query_text)).await??;

    let params = RetrievalParams::from(&config.assistant);
    let hits = knowledge::search(&conn, &query_embedding, query, &params)?;

    if hits.is_empty() {
        println!("No passages found.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let preview: String = if hit.content.chars().count() > 160 {
            format!("{}...", hit.content.chars().take(160).collect::<String>())
        } else {
            hit.content.clone()
        };
        println!("  {}. {} #{} (score: {:.4})", i + 1, hit.source, hit.chunk_index, hit.score);
        println!("     {}", preview.replace('\n', " "));
        println!();
    }
    Ok(())
}
