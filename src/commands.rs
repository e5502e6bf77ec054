//! CLI command implementations.
//!
//! Each `run_*` function opens what it needs from the config, does one
//! thing, and prints a human-readable report (or JSON with `--json`).

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use mmrag_core::error::ValidationError;
use mmrag_core::models::{ChunkModality, IngestionResult, IngestionStatus, Modality};
use mmrag_core::store::{MetadataFilter, SearchHit};

use crate::config::Config;
use crate::engine::Engine;
use crate::migrate;
use crate::retrieve::{Answer, AnswerOptions};

pub async fn run_init(config: &Config) -> Result<()> {
    migrate::run_migrations(config).await?;
    println!("Database initialized at {}", config.db.path.display());
    Ok(())
}

/// A file queued for ingestion with the name it is stored under.
struct IngestTarget {
    path: PathBuf,
    name: String,
}

/// Expand files and directories into a sorted list of files.
fn collect_targets(paths: &[PathBuf]) -> Result<Vec<IngestTarget>> {
    let mut targets = Vec::new();
    for root in paths {
        if root.is_file() {
            let name = root
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| root.display().to_string());
            targets.push(IngestTarget {
                path: root.clone(),
                name,
            });
            continue;
        }
        if !root.is_dir() {
            bail!("No such file or directory: {}", root.display());
        }

        let mut found = Vec::new();
        for entry in WalkDir::new(root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            found.push(IngestTarget {
                path: path.to_path_buf(),
                name: relative.to_string_lossy().to_string(),
            });
        }
        found.sort_by(|a, b| a.name.cmp(&b.name));
        targets.extend(found);
    }
    Ok(targets)
}

pub async fn run_ingest(
    config: &Config,
    paths: &[PathBuf],
    modality: Option<Modality>,
    json: bool,
) -> Result<()> {
    let targets = collect_targets(paths)?;
    let engine = Engine::open(config).await?;

    let mut results = Vec::with_capacity(targets.len());
    for target in &targets {
        let result = match read_within_limit(&target.path, config.ingest.max_file_bytes)? {
            Ok(bytes) => engine.ingest(&bytes, &target.name, modality).await,
            Err(e) => IngestionResult::rejected("", e.to_string()),
        };
        if !json {
            print_ingestion(&target.name, &result);
        }
        results.push((target.name.clone(), result));
    }
    engine.close().await;

    let failed = results
        .iter()
        .filter(|(_, r)| {
            matches!(
                r.status,
                IngestionStatus::Rejected | IngestionStatus::Degraded
            )
        })
        .count();

    if json {
        let report: Vec<_> = results
            .iter()
            .map(|(name, r)| serde_json::json!({ "filename": name, "result": r }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!();
        println!(
            "ingested {} file{}, {} failed",
            results.len(),
            if results.len() == 1 { "" } else { "s" },
            failed
        );
    }

    if failed > 0 {
        bail!("{} of {} documents were not committed", failed, results.len());
    }
    Ok(())
}

/// Read a file unless its size on disk is already over `limit`.
fn read_within_limit(path: &Path, limit: u64) -> Result<Result<Vec<u8>, ValidationError>> {
    let size = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len();
    if size > limit {
        return Ok(Err(ValidationError::TooLarge { size, limit }));
    }
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(Ok(bytes))
}

fn print_ingestion(name: &str, result: &IngestionResult) {
    let dedup = if result.deduplicated {
        " (unchanged)"
    } else {
        ""
    };
    println!(
        "{:<20} {}  {}  {} chunks{}",
        result.status.as_str(),
        result.document_id,
        name,
        result.chunks_committed,
        dedup
    );
    if let Some(reason) = &result.reason {
        println!("  reason: {}", reason);
    }
    for warning in &result.warnings {
        println!("  warning: {}", warning);
    }
}

pub async fn run_remove(config: &Config, document_id: &str) -> Result<()> {
    let engine = Engine::open(config).await?;
    let removed = engine.remove(document_id).await?;
    engine.close().await;
    if removed {
        println!("removed {}", document_id);
    } else {
        println!("{} was not indexed", document_id);
    }
    Ok(())
}

/// Which chunk kinds `search` and `ask` may retrieve.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scope {
    pub modality: Option<ChunkModality>,
    pub exclude_modality: Option<ChunkModality>,
}

impl Scope {
    pub fn new(modality: Option<ChunkModality>, no_images: bool) -> Self {
        Self {
            modality,
            exclude_modality: no_images.then_some(ChunkModality::Image),
        }
    }
}

pub async fn run_reset(config: &Config, confirmed: bool) -> Result<()> {
    if !confirmed {
        bail!("reset deletes every indexed document; pass --yes to confirm");
    }
    let engine = Engine::open(config).await?;
    let removed = engine.reset().await?;
    engine.close().await;
    println!(
        "removed {} document{}",
        removed,
        if removed == 1 { "" } else { "s" }
    );
    Ok(())
}

pub async fn run_search(
    config: &Config,
    query: &str,
    scope: Scope,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let engine = Engine::open(config).await?;
    let filter = MetadataFilter {
        modality: scope.modality,
        exclude_modality: scope.exclude_modality,
        ..MetadataFilter::default()
    };
    let k = limit.unwrap_or(config.retrieval.top_k);
    let hits = engine.search(query, k, &filter).await?;
    engine.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        print_hit(i + 1, hit);
    }
    Ok(())
}

fn print_hit(rank: usize, hit: &SearchHit) {
    let meta = &hit.entry.metadata;
    let location = match meta.page_number {
        Some(page) => format!("{} p.{}", meta.filename, page),
        None => meta.filename.clone(),
    };
    println!(
        "{}. [{:.3}] {} ({})",
        rank,
        hit.score,
        location,
        meta.modality.as_str()
    );
    println!("   {}", snippet(hit.entry.chunk.content.display_text(), 160));
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}

pub async fn run_ask(
    config: &Config,
    query: &str,
    session: Option<String>,
    scope: Scope,
    json: bool,
) -> Result<()> {
    let engine = Engine::open(config).await?;
    let session_id = session.unwrap_or_else(|| engine.new_session());
    let answer = engine
        .answer_with(
            query,
            &session_id,
            AnswerOptions {
                modality: scope.modality,
                exclude_modality: scope.exclude_modality,
                top_k: None,
            },
        )
        .await?;
    engine.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&answer)?);
    } else {
        print_answer(&answer);
    }
    Ok(())
}

fn print_answer(answer: &Answer) {
    println!("{}", answer.text);
    if !answer.sources.is_empty() {
        println!();
        println!("Sources:");
        for source in &answer.sources {
            let page = source
                .page_number
                .map(|p| format!(", page {}", p))
                .unwrap_or_default();
            println!(
                "  [{}] {} ({}{}) score {:.2}",
                source.marker,
                source.filename,
                source.modality.as_str(),
                page,
                source.score
            );
        }
    }
    eprintln!("session: {}", answer.session_id);
}
