//! DMR id ↔ callsign lookup table.
//!
//! Backed by a `DMRIds.dat`-style file: one `id callsign` pair per line,
//! whitespace separated, `#` comments allowed. Reloaded periodically by
//! the orchestrator so new registrations appear without a restart.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;

use tracing::info;

pub struct CallsignLookup {
    path: PathBuf,
    by_id: HashMap<u32, String>,
    by_callsign: HashMap<String, u32>,
}

impl CallsignLookup {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            by_id: HashMap::new(),
            by_callsign: HashMap::new(),
        }
    }

    /// (Re)load the table; on failure the previous contents stay.
    pub fn load(&mut self) -> io::Result<usize> {
        let file = File::open(&self.path)?;
        let mut by_id = HashMap::new();
        let mut by_callsign = HashMap::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(id), Some(callsign)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Ok(id) = id.parse::<u32>() else {
                continue;
            };
            let callsign = callsign.to_uppercase();
            by_id.insert(id, callsign.clone());
            by_callsign.entry(callsign).or_insert(id);
        }
        let total = by_id.len();
        self.by_id = by_id;
        self.by_callsign = by_callsign;
        info!(total, "loaded ids into the callsign lookup table");
        Ok(total)
    }

    pub fn exists(&self, id: u32) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Callsign for an id; falls back to the id rendered as text.
    pub fn find_callsign(&self, id: u32) -> String {
        match self.by_id.get(&id) {
            Some(callsign) => callsign.clone(),
            None => id.to_string(),
        }
    }

    /// Id for a callsign (0 when unknown).
    pub fn find_id(&self, callsign: &str) -> u32 {
        self.by_callsign
            .get(&callsign.to_uppercase())
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DMRIds.dat");
        std::fs::write(&path, "# header\n2147001 EA7EE\n2141234 ea7abc\njunk\n").unwrap();
        let mut lookup = CallsignLookup::new(&path);
        assert_eq!(lookup.load().unwrap(), 2);

        assert!(lookup.exists(2147001));
        assert_eq!(lookup.find_callsign(2147001), "EA7EE");
        assert_eq!(lookup.find_callsign(2141234), "EA7ABC");
        assert_eq!(lookup.find_callsign(5), "5");
        assert_eq!(lookup.find_id("ea7ee"), 2147001);
        assert_eq!(lookup.find_id("N0CALL"), 0);
    }

    #[test]
    fn test_failed_reload_keeps_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DMRIds.dat");
        std::fs::write(&path, "1 AA1AA\n").unwrap();
        let mut lookup = CallsignLookup::new(&path);
        lookup.load().unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(lookup.load().is_err());
        assert!(lookup.exists(1));
    }
}
