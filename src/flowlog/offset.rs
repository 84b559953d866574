//! Backpressure signal for adaptive aggregation
//!
//! A log shipper records how far it has read into every file it tails. The
//! difference between a flow log file's size and the recorded position is
//! how far the downstream pipeline is behind.

use super::AggregationKind;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Unread bytes per flow log file.
pub type Offsets = BTreeMap<PathBuf, u64>;

pub trait LogOffset: Send + Sync {
    fn read(&self) -> Offsets;

    fn is_behind(&self, offsets: &Offsets) -> bool;

    /// Suggested number of levels to coarsen by while behind.
    fn increase_factor(&self, offsets: &Offsets) -> i32;
}

/// Never reports lag.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpLogOffset;

impl LogOffset for NoOpLogOffset {
    fn read(&self) -> Offsets {
        Offsets::new()
    }

    fn is_behind(&self, _offsets: &Offsets) -> bool {
        false
    }

    fn increase_factor(&self, _offsets: &Offsets) -> i32 {
        0
    }
}

/// Reads a positions file of `<path>\t<hex offset>\t<hex inode>` lines.
#[derive(Debug, Clone)]
pub struct PositionsFileLogOffset {
    positions_file: PathBuf,
    log_files: Vec<PathBuf>,
    threshold_bytes: u64,
}

impl PositionsFileLogOffset {
    pub fn new(positions_file: impl Into<PathBuf>, log_files: Vec<PathBuf>, threshold_bytes: u64) -> Self {
        Self {
            positions_file: positions_file.into(),
            log_files,
            threshold_bytes: threshold_bytes.max(1),
        }
    }

    fn read_positions(&self) -> BTreeMap<PathBuf, u64> {
        let content = match fs::read_to_string(&self.positions_file) {
            Ok(content) => content,
            Err(e) => {
                debug!(
                    "Positions file {} not readable: {}",
                    self.positions_file.display(),
                    e
                );
                return BTreeMap::new();
            }
        };
        parse_positions(&content)
    }
}

pub(crate) fn parse_positions(content: &str) -> BTreeMap<PathBuf, u64> {
    let mut positions = BTreeMap::new();
    for line in content.lines() {
        let mut fields = line.split('\t');
        let (Some(path), Some(offset)) = (fields.next(), fields.next()) else {
            continue;
        };
        match u64::from_str_radix(offset.trim(), 16) {
            Ok(offset) => {
                positions.insert(PathBuf::from(path), offset);
            }
            Err(e) => warn!("Skipping positions entry for {}: {}", path, e),
        }
    }
    positions
}

fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path).map(|m| m.len()).ok()
}

impl LogOffset for PositionsFileLogOffset {
    fn read(&self) -> Offsets {
        let positions = self.read_positions();
        let mut offsets = Offsets::new();
        for file in &self.log_files {
            let Some(size) = file_size(file) else {
                continue;
            };
            let read = positions.get(file).copied().unwrap_or(0);
            offsets.insert(file.clone(), size.saturating_sub(read));
        }
        offsets
    }

    fn is_behind(&self, offsets: &Offsets) -> bool {
        offsets.values().any(|lag| *lag > self.threshold_bytes)
    }

    fn increase_factor(&self, offsets: &Offsets) -> i32 {
        let lag = offsets.values().copied().max().unwrap_or(0);
        let factor = (lag / self.threshold_bytes).max(1);
        factor.min(AggregationKind::ALL.len() as u64) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_positions_skips_bad_lines() {
        let positions = parse_positions(
            "/var/log/flows.log\t00000000000003e8\t0000000000abcdef\nbroken\n/var/log/x.log\tzz\t1\n",
        );
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[Path::new("/var/log/flows.log")], 1000);
    }

    #[test]
    fn test_lag_against_positions_file() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let log = dir.path().join("flows.log");
        fs::write(&log, vec![b'x'; 5000]).expect("Should write log");
        let positions = dir.path().join("pos");
        fs::write(&positions, format!("{}\t{:x}\t1\n", log.display(), 1000)).expect("write");

        let offset = PositionsFileLogOffset::new(&positions, vec![log.clone()], 1000);
        let offsets = offset.read();
        assert_eq!(offsets[&log], 4000);
        assert!(offset.is_behind(&offsets));
        assert_eq!(offset.increase_factor(&offsets), 4);

        fs::write(&positions, format!("{}\t{:x}\t1\n", log.display(), 5000)).expect("write");
        let offsets = offset.read();
        assert!(!offset.is_behind(&offsets));
        assert_eq!(offset.increase_factor(&offsets), 1);
    }

    #[test]
    fn test_missing_positions_file_counts_whole_file() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let log = dir.path().join("flows.log");
        fs::write(&log, vec![b'x'; 50]).expect("Should write log");

        let offset = PositionsFileLogOffset::new(dir.path().join("missing"), vec![log.clone()], 10);
        let offsets = offset.read();
        assert_eq!(offsets[&log], 50);
        assert_eq!(offset.increase_factor(&offsets), 4);
        assert!(!NoOpLogOffset.is_behind(&NoOpLogOffset.read()));
    }
}
