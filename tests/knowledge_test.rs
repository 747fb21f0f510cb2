mod helpers;

use medimimes::assistant::knowledge::{ingest_text, remove_source, search, RetrievalParams};
use medimimes::config::AssistantConfig;
use medimimes::embedding::hashed::HashedEmbeddingProvider;
use medimimes::embedding::EmbeddingProvider;

use helpers::*;

const MISSED_DOSE_GUIDE: &str = "\
If you miss a dose, take it as soon as you remember.

If it is almost time for your next dose, skip the missed dose and continue your regular schedule.

Never take a double dose to make up for a missed one.";

const STORAGE_GUIDE: &str = "\
Store tablets at room temperature away from moisture and heat.

Keep insulin in the refrigerator until opened.";

fn chunk_count(conn: &rusqlite::Connection, source: &str) -> i64 {
    conn.query_row(
        "SELECT COUNT(*) FROM kb_chunks WHERE source = ?1",
        [source],
        |row| row.get(0),
    )
    .unwrap()
}

fn small_chunks() -> AssistantConfig {
    AssistantConfig {
        chunk_size: 120,
        chunk_overlap: 20,
        ..Default::default()
    }
}

#[test]
fn ingest_and_search_finds_relevant_passage() {
    let mut conn = test_db();
    let embedder = HashedEmbeddingProvider::new();
    let config = small_chunks();
    let now = at(2025, 3, 1, 9, 0);

    let n = ingest_text(&mut conn, &embedder, "missed-doses.md", MISSED_DOSE_GUIDE, &config, now).unwrap();
    assert!(n >= 2, "expected several chunks, got {n}");
    ingest_text(&mut conn, &embedder, "storage.md", STORAGE_GUIDE, &config, now).unwrap();

    let question = "what if I miss a dose";
    let query = embedder.embed(question).unwrap();
    let params = RetrievalParams::from(&config);
    let hits = search(&conn, &query, question, &params).unwrap();

    assert!(!hits.is_empty());
    assert!(hits.len() <= params.k);
    assert_eq!(hits[0].source, "missed-doses.md");
    assert!(hits[0].content.to_lowercase().contains("miss"));
}

#[test]
fn reingest_replaces_source() {
    let mut conn = test_db();
    let embedder = HashedEmbeddingProvider::new();
    let config = small_chunks();
    let now = at(2025, 3, 1, 9, 0);

    ingest_text(&mut conn, &embedder, "guide.md", MISSED_DOSE_GUIDE, &config, now).unwrap();
    let before = chunk_count(&conn, "guide.md");
    ingest_text(&mut conn, &embedder, "guide.md", "Take with food.", &config, now).unwrap();
    assert!(before > 1);
    assert_eq!(chunk_count(&conn, "guide.md"), 1);

    let vectors: i64 = conn
        .query_row("SELECT COUNT(*) FROM kb_vec", [], |row| row.get(0))
        .unwrap();
    assert_eq!(vectors, 1);
}

#[test]
fn removed_source_is_not_searchable() {
    let mut conn = test_db();
    let embedder = HashedEmbeddingProvider::new();
    let config = small_chunks();
    ingest_text(&mut conn, &embedder, "storage.md", STORAGE_GUIDE, &config, at(2025, 3, 1, 9, 0)).unwrap();

    let removed = remove_source(&conn, "storage.md").unwrap();
    assert!(removed > 0);
    assert_eq!(chunk_count(&conn, "storage.md"), 0);

    let question = "where to store insulin";
    let query = embedder.embed(question).unwrap();
    let hits = search(&conn, &query, question, &RetrievalParams::from(&config)).unwrap();
    assert!(hits.is_empty());
}
