//! Chunk discovery, ordering and reassembly.
//!
//! Uploaded videos arrive as `*.chunk` files whose names embed a
//! sequence number. Merging concatenates them in ascending numeric
//! order into a single input file for the transcoder.

use regex::Regex;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

/// Ordering key assigned to a chunk whose file name carries no digits.
/// Sorts before every numbered chunk.
pub const UNNUMBERED_CHUNK_KEY: i64 = -1;

/// File extension identifying upload chunks.
const CHUNK_EXTENSION: &str = "chunk";

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("failed to list chunks in {dir}: {source}")]
    ListDir {
        dir: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to create merged file {file}: {source}")]
    CreateOutput {
        file: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to open chunk {chunk}: {source}")]
    OpenChunk {
        chunk: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to append chunk {chunk}: {source}")]
    AppendChunk {
        chunk: PathBuf,
        source: std::io::Error,
    },
}

/// Ordering key for a chunk: the first run of digits in its file name,
/// or [`UNNUMBERED_CHUNK_KEY`] when none can be extracted.
pub fn chunk_key(path: &Path) -> i64 {
    let re = Regex::new(r"\d+").unwrap();
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_default();

    re.find(&file_name)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(UNNUMBERED_CHUNK_KEY)
}

/// Concatenate every `*.chunk` file under `input_dir` into
/// `output_file`, ascending by numeric key. Ties keep discovery
/// (lexical) order. Returns the number of chunks merged.
///
/// The sequence is not checked for gaps: a missing index produces a
/// shorter merged file, not an error. A partially written output is
/// left behind when a chunk fails mid-merge; cleanup is the caller's
/// concern.
pub async fn merge_chunks(input_dir: &Path, output_file: &Path) -> Result<usize, MergeError> {
    let chunks = discover_chunks(input_dir).await?;

    let output = File::create(output_file)
        .await
        .map_err(|source| MergeError::CreateOutput {
            file: output_file.to_path_buf(),
            source,
        })?;
    let mut output = BufWriter::new(output);

    for chunk in &chunks {
        let mut input = File::open(chunk)
            .await
            .map_err(|source| MergeError::OpenChunk {
                chunk: chunk.clone(),
                source,
            })?;
        tokio::io::copy(&mut input, &mut output)
            .await
            .map_err(|source| MergeError::AppendChunk {
                chunk: chunk.clone(),
                source,
            })?;
    }

    output
        .flush()
        .await
        .map_err(|source| MergeError::CreateOutput {
            file: output_file.to_path_buf(),
            source,
        })?;

    Ok(chunks.len())
}

/// List the chunk files in `dir`, sorted by numeric key. The list is
/// pre-sorted lexically so the stable numeric sort keeps a
/// deterministic order for duplicate keys.
async fn discover_chunks(dir: &Path) -> Result<Vec<PathBuf>, MergeError> {
    let mut chunks = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|source| MergeError::ListDir {
            dir: dir.to_path_buf(),
            source,
        })?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|source| MergeError::ListDir {
            dir: dir.to_path_buf(),
            source,
        })?
    {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some(CHUNK_EXTENSION) {
            chunks.push(path);
        }
    }

    chunks.sort();
    chunks.sort_by_key(|path| chunk_key(path));
    Ok(chunks)
}
