// src/logbook.rs — per-process log files
//
// Every rank writes `process<rank>_<app>.log`: one line per send, receive,
// or note, in the fixed `N<rank> [clk|<clock>]: <message>` form, preceded by
// a single timestamped header. Lines are mirrored to `tracing` so --verbose
// streams the same material to stderr.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use chrono::Utc;

use crate::storage::Rank;

pub struct Logbook {
    rank: Rank,
    out: Option<BufWriter<File>>,
}

impl Logbook {
    /// Open `process<rank>_<app>.log` under `dir` and stamp the header line.
    pub fn open(dir: &Path, rank: Rank, app: &str) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("process{rank}_{app}.log"));
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "# memtree process {rank} ({app}) opened {}", Utc::now().to_rfc3339())?;
        out.flush()?;
        Ok(Logbook { rank, out: Some(out) })
    }

    /// A logbook that only mirrors to tracing. Used by ranks that must not
    /// touch the filesystem.
    pub fn sink(rank: Rank) -> Self {
        Logbook { rank, out: None }
    }

    pub fn line(&mut self, clock: u64, msg: &str) {
        tracing::debug!(rank = self.rank, clock, "{msg}");
        if let Some(out) = self.out.as_mut() {
            let _ = writeln!(out, "N{} [clk|{}]: {}", self.rank, clock, msg);
            let _ = out.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_carry_the_rank_and_clock_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut book = Logbook::open(dir.path(), 3, "SimpleAlloc").expect("open");
        book.line(17, "send: probe");
        let text =
            std::fs::read_to_string(dir.path().join("process3_SimpleAlloc.log")).expect("read");
        let mut lines = text.lines();
        assert!(lines.next().expect("header").starts_with("# memtree process 3"));
        assert_eq!(lines.next(), Some("N3 [clk|17]: send: probe"));
    }
}
