//! Persisted iteration progress
//!
//! Records are appended as JSON lines, each holding an iteration context and
//! its completion bit-vector packed least-significant-bit first, zlib
//! compressed and base64 encoded. Several contexts may share one file; the
//! last record for a context wins.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{CoordinationError, CoordinationResult};
use crate::jobs::IterationContext;

#[derive(Debug, Serialize, Deserialize)]
struct ResumptionRecord {
    context: IterationContext,
    complete: String,
}

/// Append-only store of completion state keyed by iteration context
#[derive(Debug, Clone)]
pub struct ResumptionStore {
    path: PathBuf,
}

impl ResumptionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Completion state last saved for `context`.
    ///
    /// A missing file, an unreadable file or corrupt records are all treated
    /// as "no prior state" and never fail the caller.
    pub async fn load(&self, context: &IterationContext) -> Option<Vec<bool>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("No resumption file at {}", self.path.display());
                return None;
            }
            Err(err) => {
                warn!(
                    "Unable to read resumption file {}: {}; starting from scratch",
                    self.path.display(),
                    err
                );
                return None;
            }
        };

        let mut found = None;
        for (number, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: ResumptionRecord = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(err) => {
                    warn!(
                        "Ignoring corrupt record on line {} of {}: {}",
                        number + 1,
                        self.path.display(),
                        err
                    );
                    continue;
                }
            };
            if &record.context != context {
                continue;
            }
            match decode_bits(&record.complete, context.job_count) {
                Ok(complete) => found = Some(complete),
                Err(err) => warn!(
                    "Ignoring undecodable record on line {} of {}: {}",
                    number + 1,
                    self.path.display(),
                    err
                ),
            }
        }
        found
    }

    /// Append the completion state for `context`
    pub async fn save(&self, context: &IterationContext, complete: &[bool]) -> CoordinationResult<()> {
        let record = ResumptionRecord {
            context: context.clone(),
            complete: encode_bits(complete)?,
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Pack, compress and encode a completion bit-vector
pub fn encode_bits(bits: &[bool]) -> CoordinationResult<String> {
    let mut packed = vec![0u8; bits.len().div_ceil(8)];
    for (index, bit) in bits.iter().enumerate() {
        if *bit {
            packed[index / 8] |= 1 << (index % 8);
        }
    }

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&packed)?;
    Ok(STANDARD.encode(encoder.finish()?))
}

/// Inverse of [`encode_bits`] for a vector of `len` bits
pub fn decode_bits(encoded: &str, len: usize) -> CoordinationResult<Vec<bool>> {
    let compressed = STANDARD.decode(encoded)?;
    let mut packed = Vec::new();
    ZlibDecoder::new(&compressed[..]).read_to_end(&mut packed)?;

    if packed.len() != len.div_ceil(8) {
        return Err(CoordinationError::Codec(format!(
            "expected {} packed bytes for {} jobs, found {}",
            len.div_ceil(8),
            len,
            packed.len()
        )));
    }
    Ok((0..len)
        .map(|index| packed[index / 8] & (1 << (index % 8)) != 0)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context(job_count: usize) -> IterationContext {
        IterationContext {
            argv: "analyse --all".to_string(),
            resume_id: "halo-loop".to_string(),
            job_count,
        }
    }

    #[test]
    fn test_bits_survive_encoding() {
        let bits = vec![true, false, false, true, true, false, true, false, true, true, false];
        let encoded = encode_bits(&bits).unwrap();
        assert_eq!(decode_bits(&encoded, bits.len()).unwrap(), bits);
        assert!(decode_bits(&encoded, 40).is_err());
        assert!(decode_bits("***", 3).is_err());
    }

    #[tokio::test]
    async fn test_missing_file_means_no_state() {
        let dir = TempDir::new().unwrap();
        let store = ResumptionStore::new(dir.path().join("absent.jsonl"));
        assert!(store.load(&context(4)).await.is_none());
    }

    #[tokio::test]
    async fn test_last_record_wins_per_context() {
        let dir = TempDir::new().unwrap();
        let store = ResumptionStore::new(dir.path().join("resume.jsonl"));
        let other = IterationContext {
            resume_id: "other-loop".to_string(),
            ..context(4)
        };

        store.save(&context(4), &[true, false, false, false]).await.unwrap();
        store.save(&other, &[true, true, true, true]).await.unwrap();
        store.save(&context(4), &[true, true, false, false]).await.unwrap();

        assert_eq!(
            store.load(&context(4)).await.unwrap(),
            vec![true, true, false, false]
        );
        assert_eq!(store.load(&other).await.unwrap(), vec![true; 4]);
        assert!(store.load(&context(5)).await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resume.jsonl");
        let store = ResumptionStore::new(&path);

        store.save(&context(3), &[true, false, true]).await.unwrap();
        let mut contents = tokio::fs::read_to_string(&path).await.unwrap();
        contents.push_str("{not json\n");
        contents.push_str(
            "{\"context\":{\"argv\":\"analyse --all\",\"resume_id\":\"halo-loop\",\"job_count\":3},\"complete\":\"!!\"}\n",
        );
        tokio::fs::write(&path, contents).await.unwrap();

        assert_eq!(store.load(&context(3)).await.unwrap(), vec![true, false, true]);
    }
}
