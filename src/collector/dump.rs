//! Plain-text dump of the flow table

use crate::collector::data::Data;
use crate::Result;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub const DUMP_STARTED: &str = "Stats Dump Started:";
pub const DUMP_ENTRIES: &str = "Number of Entries:";
pub const DUMP_COMPLETED: &str = "Stats Dump Completed:";

fn timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:03}", now.as_secs(), now.subsec_millis())
}

/// Overwrite `path` with one line per record, framed by start and end markers.
pub fn write_dump<'a>(path: &Path, records: impl ExactSizeIterator<Item = &'a Data>) -> Result<usize> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut out = BufWriter::new(File::create(path)?);
    let count = records.len();

    writeln!(out, "{} {}", DUMP_STARTED, timestamp())?;
    writeln!(out, "{} {}", DUMP_ENTRIES, count)?;
    for data in records {
        writeln!(out, "{}", data)?;
    }
    writeln!(out, "{} {}", DUMP_COMPLETED, timestamp())?;
    out.flush()?;
    Ok(count)
}

/// Summary of a dump file, as produced by [`write_dump`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpSummary {
    pub started: Option<String>,
    pub completed: Option<String>,
    pub declared_entries: Option<usize>,
    pub records: usize,
}

pub fn summarize_dump(contents: &str) -> DumpSummary {
    let mut summary = DumpSummary {
        started: None,
        completed: None,
        declared_entries: None,
        records: 0,
    };
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix(DUMP_STARTED) {
            summary.started = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix(DUMP_COMPLETED) {
            summary.completed = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix(DUMP_ENTRIES) {
            summary.declared_entries = rest.trim().parse().ok();
        } else if line.starts_with("tuple=") {
            summary.records += 1;
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowscope_common::Tuple;

    #[test]
    fn test_dump_overwrites_and_summarizes() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let path = dir.path().join("stats").join("dump");
        fs::create_dir_all(path.parent().expect("parent")).expect("Should create dir");
        fs::write(&path, "stale line\nstale line\nstale line\n").expect("Should write");

        let records = vec![
            Data::new(Tuple::new([1; 16], [2; 16], 6, 1, 2), None, None, 5),
            Data::new(Tuple::new([3; 16], [4; 16], 17, 3, 4), None, None, 5),
        ];
        let written = write_dump(&path, records.iter()).expect("Should dump");
        assert_eq!(written, 2);

        let contents = fs::read_to_string(&path).expect("Should read");
        assert!(!contents.contains("stale"));

        let summary = summarize_dump(&contents);
        assert_eq!(summary.declared_entries, Some(2));
        assert_eq!(summary.records, 2);
        assert!(summary.started.is_some());
        assert!(summary.completed.is_some());
    }
}
