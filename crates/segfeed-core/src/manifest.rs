use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use thiserror::Error;

use crate::types::ClipRecord;

/// Ordered clip index, loaded once at startup.
///
/// Insertion order is file order until [`Manifest::shuffle`] permutes it.
/// Records are permuted whole, so a clip and its duration can never
/// desynchronize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    records: Vec<ClipRecord>,
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("manifest contains no clips")]
    Empty,
}

impl Manifest {
    /// Reads a manifest file: one clip per line, `<path> <duration> <label>`,
    /// whitespace-separated, no header. Blank lines are skipped; any malformed
    /// line fails the whole load.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let mut records = Vec::new();
        for (i, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let record = parse_line(line).map_err(|reason| ManifestError::Parse {
                line: i + 1,
                reason,
            })?;
            records.push(record);
        }
        Self::from_records(records)
    }

    pub fn from_records(records: Vec<ClipRecord>) -> Result<Self, ManifestError> {
        if records.is_empty() {
            return Err(ManifestError::Empty);
        }
        Ok(Self { records })
    }

    pub fn records(&self) -> &[ClipRecord] {
        &self.records
    }

    pub fn get(&self, index: usize) -> Option<&ClipRecord> {
        self.records.get(index)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Permutes the records in place. Two RNGs in identical states produce
    /// identical permutations, so a run is reproducible from its seed.
    pub fn shuffle(&mut self, rng: &mut StdRng) {
        self.records.shuffle(rng);
    }

    /// Drops every clip shorter than `min_frames` and returns how many were
    /// removed. The caller decides whether an emptied manifest is fatal.
    pub fn retain_min_duration(&mut self, min_frames: u64) -> usize {
        let before = self.records.len();
        self.records.retain(|r| r.duration_frames >= min_frames);
        before - self.records.len()
    }
}

fn parse_line(line: &str) -> Result<ClipRecord, String> {
    let mut fields = line.split_whitespace();
    let path = fields
        .next()
        .ok_or_else(|| "missing clip path".to_string())?
        .to_string();
    let duration = fields
        .next()
        .ok_or_else(|| "missing duration".to_string())?;
    let label = fields.next().ok_or_else(|| "missing label".to_string())?;
    if fields.next().is_some() {
        return Err("expected exactly 3 fields: <path> <duration> <label>".to_string());
    }

    let duration_frames: u64 = duration
        .parse()
        .map_err(|_| format!("bad duration {duration:?}"))?;
    let label: u64 = label.parse().map_err(|_| format!("bad label {label:?}"))?;

    let record = ClipRecord {
        path,
        duration_frames,
        label,
    };
    record.validate().map_err(|e| e.to_string())?;
    Ok(record)
}
