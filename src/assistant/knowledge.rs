//! Knowledge base: chunking, storage, and hybrid retrieval.
//!
//! Documents are split with a recursive character splitter, embedded, and
//! written to `kb_chunks` with mirrors in `kb_fts` (BM25) and `kb_vec` (KNN).
//! Retrieval fuses both rankings with Reciprocal Rank Fusion, then picks the
//! final passages with Maximal Marginal Relevance so near-duplicate chunks do
//! not crowd out each other.

use std::collections::{HashMap, VecDeque};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::config::AssistantConfig;
use crate::embedding::{cosine, EmbeddingProvider, EMBEDDING_DIM};
use crate::meds::types::format_datetime;

const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeHit {
    pub id: String,
    pub source: String,
    pub chunk_index: u32,
    pub content: String,
    /// Fused rank score before MMR.
    pub score: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct RetrievalParams {
    pub k: usize,
    pub fetch_k: usize,
    pub lambda: f32,
    pub rrf_k: usize,
}

impl From<&AssistantConfig> for RetrievalParams {
    fn from(config: &AssistantConfig) -> Self {
        Self {
            k: config.retrieval_k,
            fetch_k: config.fetch_k.max(config.retrieval_k),
            lambda: config.mmr_lambda,
            rrf_k: config.rrf_k,
        }
    }
}

// ── Splitting ─────────────────────────────────────────────────────────────────

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Split `text` into chunks of at most `chunk_size` characters, carrying up
/// to `overlap` characters of context between neighbours.
///
/// Paragraph breaks are preferred, then line breaks, then spaces; a single
/// unbreakable run longer than `chunk_size` is cut by character.
pub fn split_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let overlap = overlap.min(chunk_size.saturating_sub(1));
    split_recursive(text, &SEPARATORS, chunk_size, overlap)
}

fn split_recursive(text: &str, separators: &[&str], size: usize, overlap: usize) -> Vec<String> {
    let idx = separators
        .iter()
        .position(|s| s.is_empty() || text.contains(s))
        .unwrap_or(separators.len().saturating_sub(1));
    let sep = separators.get(idx).copied().unwrap_or("");
    let rest = separators.get(idx + 1..).unwrap_or(&[]);

    let pieces: Vec<&str> = if sep.is_empty() {
        text.char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect()
    } else {
        text.split(sep).filter(|p| !p.is_empty()).collect()
    };

    let mut chunks = Vec::new();
    let mut fitting: Vec<&str> = Vec::new();
    for piece in pieces {
        if char_len(piece) < size {
            fitting.push(piece);
            continue;
        }
        if !fitting.is_empty() {
            chunks.extend(merge_pieces(&fitting, sep, size, overlap));
            fitting.clear();
        }
        if rest.is_empty() {
            chunks.push(piece.to_string());
        } else {
            chunks.extend(split_recursive(piece, rest, size, overlap));
        }
    }
    if !fitting.is_empty() {
        chunks.extend(merge_pieces(&fitting, sep, size, overlap));
    }
    chunks
}

/// Greedily join pieces with `sep` up to `size`, keeping a tail of at most
/// `overlap` characters as the start of the next chunk.
fn merge_pieces(pieces: &[&str], sep: &str, size: usize, overlap: usize) -> Vec<String> {
    let sep_len = char_len(sep);
    let mut out = Vec::new();
    let mut window: VecDeque<&str> = VecDeque::new();
    let mut total = 0usize;

    let emit = |window: &VecDeque<&str>, out: &mut Vec<String>| {
        let joined = window.iter().copied().collect::<Vec<_>>().join(sep);
        let trimmed = joined.trim();
        if !trimmed.is_empty() {
            out.push(trimmed.to_string());
        }
    };

    for &piece in pieces {
        let len = char_len(piece);
        let joiner = if window.is_empty() { 0 } else { sep_len };
        if total + len + joiner > size && !window.is_empty() {
            emit(&window, &mut out);
            loop {
                let joiner = if window.is_empty() { 0 } else { sep_len };
                let overflows = total > 0 && total + len + joiner > size;
                if total <= overlap && !overflows {
                    break;
                }
                let Some(front) = window.pop_front() else { break };
                let dropped_joiner = if window.is_empty() { 0 } else { sep_len };
                total -= char_len(front) + dropped_joiner;
            }
        }
        let joiner = if window.is_empty() { 0 } else { sep_len };
        window.push_back(piece);
        total += len + joiner;
    }
    if !window.is_empty() {
        emit(&window, &mut out);
    }
    out
}

// ── Storage ───────────────────────────────────────────────────────────────────

fn vector_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn bytes_vector(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Delete every chunk of `source` from all three tables. Returns the count.
pub fn remove_source(conn: &Connection, source: &str) -> Result<usize> {
    let mut stmt =
        conn.prepare("SELECT rowid, id, content FROM kb_chunks WHERE source = ?1")?;
    let rows = stmt
        .query_map(params![source], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (rowid, id, content) in &rows {
        conn.execute(
            "INSERT INTO kb_fts (kb_fts, rowid, content, id) VALUES ('delete', ?1, ?2, ?3)",
            params![rowid, content, id],
        )?;
        conn.execute("DELETE FROM kb_vec WHERE id = ?1", params![id])?;
    }
    conn.execute("DELETE FROM kb_chunks WHERE source = ?1", params![source])?;
    Ok(rows.len())
}

/// Replace the stored chunks of `source` with `chunks` and their vectors.
pub fn store_chunks(
    conn: &mut Connection,
    source: &str,
    chunks: &[String],
    embeddings: &[Vec<f32>],
    now: NaiveDateTime,
) -> Result<usize> {
    anyhow::ensure!(
        chunks.len() == embeddings.len(),
        "{} chunks but {} embeddings",
        chunks.len(),
        embeddings.len()
    );

    let tx = conn.transaction()?;
    let replaced = remove_source(&tx, source)?;
    let created_at = format_datetime(now);

    for (index, (content, embedding)) in chunks.iter().zip(embeddings).enumerate() {
        anyhow::ensure!(
            embedding.len() == EMBEDDING_DIM,
            "embedding has {} dimensions, expected {EMBEDDING_DIM}",
            embedding.len()
        );
        let id = uuid::Uuid::now_v7().to_string();
        tx.execute(
            "INSERT INTO kb_chunks (id, source, chunk_index, content, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, source, index as i64, content, created_at],
        )?;
        let rowid = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO kb_fts (rowid, content, id) VALUES (?1, ?2, ?3)",
            params![rowid, content, id],
        )?;
        tx.execute(
            "INSERT INTO kb_vec (id, embedding) VALUES (?1, ?2)",
            params![id, vector_bytes(embedding)],
        )?;
    }
    tx.commit()?;

    tracing::info!(source, chunks = chunks.len(), replaced, "knowledge source stored");
    Ok(chunks.len())
}

/// Split, embed, and store a document in one go.
pub fn ingest_text(
    conn: &mut Connection,
    embedder: &dyn EmbeddingProvider,
    source: &str,
    text: &str,
    config: &AssistantConfig,
    now: NaiveDateTime,
) -> Result<usize> {
    let chunks = split_text(text, config.chunk_size, config.chunk_overlap);
    let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
    let embeddings = embedder
        .embed_batch(&refs)
        .with_context(|| format!("failed to embed {source}"))?;
    store_chunks(conn, source, &chunks, &embeddings, now)
}

// ── Retrieval ─────────────────────────────────────────────────────────────────

fn vector_search(conn: &Connection, embedding: &[f32], limit: usize) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM kb_vec WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    let ids = stmt
        .query_map(params![vector_bytes(embedding), limit as i64], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Natural-language questions rarely contain every term, so terms are OR-ed.
fn fts_query(text: &str) -> String {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 2)
        .map(|w| format!("\"{}\"", w.to_lowercase()))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn fts_search(conn: &Connection, query_text: &str, limit: usize) -> Result<Vec<String>> {
    let query = fts_query(query_text);
    if query.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(
        "SELECT id FROM kb_fts WHERE kb_fts MATCH ?1 ORDER BY rank LIMIT ?2",
    )?;
    let ids = stmt
        .query_map(params![query, limit as i64], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Reciprocal Rank Fusion over any number of ranked id lists.
pub fn rrf_merge(lists: &[Vec<String>], k: usize) -> Vec<(String, f64)> {
    let mut scores: HashMap<&str, f64> = HashMap::new();
    for list in lists {
        for (rank, id) in list.iter().enumerate() {
            *scores.entry(id.as_str()).or_insert(0.0) += 1.0 / (k as f64 + rank as f64 + 1.0);
        }
    }
    let mut merged: Vec<(String, f64)> = scores
        .into_iter()
        .map(|(id, score)| (id.to_string(), score))
        .collect();
    merged.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    merged
}

/// Maximal Marginal Relevance: indices of `k` candidates balancing query
/// similarity (weight `lambda`) against similarity to already chosen ones.
pub fn mmr_select(query: &[f32], candidates: &[Vec<f32>], k: usize, lambda: f32) -> Vec<usize> {
    let relevance: Vec<f32> = candidates.iter().map(|c| cosine(query, c)).collect();
    let mut chosen: Vec<usize> = Vec::with_capacity(k);
    let mut remaining: Vec<usize> = (0..candidates.len()).collect();

    while chosen.len() < k && !remaining.is_empty() {
        let mut best = (0usize, f32::NEG_INFINITY);
        for (pos, &i) in remaining.iter().enumerate() {
            let redundancy = chosen
                .iter()
                .map(|&j| cosine(&candidates[i], &candidates[j]))
                .fold(f32::NEG_INFINITY, f32::max);
            let redundancy = if chosen.is_empty() { 0.0 } else { redundancy };
            let score = lambda * relevance[i] - (1.0 - lambda) * redundancy;
            if score > best.1 {
                best = (pos, score);
            }
        }
        chosen.push(remaining.remove(best.0));
    }
    chosen
}

struct ChunkRow {
    source: String,
    chunk_index: u32,
    content: String,
    embedding: Vec<f32>,
}

fn fetch_chunk(conn: &Connection, id: &str) -> Result<Option<ChunkRow>> {
    let row = conn
        .query_row(
            "SELECT source, chunk_index, content FROM kb_chunks WHERE id = ?1",
            params![id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?, row.get::<_, String>(2)?)),
        )
        .optional()?;
    let Some((source, chunk_index, content)) = row else {
        return Ok(None);
    };
    let blob: Option<Vec<u8>> = conn
        .query_row("SELECT embedding FROM kb_vec WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?;
    Ok(Some(ChunkRow {
        source,
        chunk_index,
        content,
        embedding: blob.map(|b| bytes_vector(&b)).unwrap_or_default(),
    }))
}

/// Hybrid search followed by MMR. Returns at most `params.k` passages.
pub fn search(
    conn: &Connection,
    query_embedding: &[f32],
    query_text: &str,
    params: &RetrievalParams,
) -> Result<Vec<KnowledgeHit>> {
    let vec_ids = vector_search(conn, query_embedding, params.fetch_k)?;
    let fts_ids = fts_search(conn, query_text, params.fetch_k)?;
    let merged = rrf_merge(&[vec_ids, fts_ids], params.rrf_k);

    let mut hits = Vec::new();
    let mut vectors = Vec::new();
    for (id, score) in merged.into_iter().take(params.fetch_k) {
        if let Some(row) = fetch_chunk(conn, &id)? {
            vectors.push(row.embedding);
            hits.push(KnowledgeHit {
                id,
                source: row.source,
                chunk_index: row.chunk_index,
                content: row.content,
                score,
            });
        }
    }

    let picked = mmr_select(query_embedding, &vectors, params.k, params.lambda);
    let mut slots: Vec<Option<KnowledgeHit>> = hits.into_iter().map(Some).collect();
    Ok(picked
        .into_iter()
        .filter_map(|i| slots.get_mut(i).and_then(Option::take))
        .collect())
}
