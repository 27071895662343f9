//! Talk-group registry.
//!
//! Loaded from a semicolon-separated text file and shared between the
//! event loop and a background reload thread; the list is replaced
//! atomically under the mutex so lookups never observe a torn list.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

/// Call type of a registry entry, from the `opt` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TgKind {
    /// Plain talk group
    Group,
    /// Server-side conference reflector
    Reflector,
    /// Private (user-to-user) call
    Private,
}

impl TgKind {
    fn from_opt(opt: &str) -> Self {
        match opt.trim() {
            "1" => TgKind::Reflector,
            "2" => TgKind::Private,
            _ => TgKind::Group,
        }
    }
}

/// One talk-group registry row.
#[derive(Debug, Clone)]
pub struct TgEntry {
    /// 7-character zero-padded numeric id
    pub id: String,
    pub kind: TgKind,
    /// 3-digit active-link count
    pub count: String,
    /// 16-character space-padded name
    pub name: String,
    /// 14-character space-padded description
    pub desc: String,
}

impl TgEntry {
    pub fn id_number(&self) -> u32 {
        self.id.trim_start_matches('0').parse().unwrap_or(0)
    }

    /// The 5-digit id shown to the handset (low digits of the full id).
    pub fn short_id(&self) -> &str {
        &self.id[2..7]
    }
}

/// Result of resolving a 5-digit handset selection against the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub kind: TgKind,
    /// The full (up to 7 digit) destination id
    pub full_id: u32,
    pub count: u32,
}

/// The registry proper; wrap in `Arc` to share with the reload thread.
pub struct TgRegistry {
    path: PathBuf,
    make_upper: bool,
    entries: Mutex<Vec<Arc<TgEntry>>>,
}

impl TgRegistry {
    pub fn new(path: impl Into<PathBuf>, make_upper: bool) -> Self {
        Self { path: path.into(), make_upper, entries: Mutex::new(Vec::new()) }
    }

    /// (Re)load the registry file. On failure the previous list stays.
    pub fn load(&self) -> io::Result<usize> {
        let file = File::open(&self.path)?;
        let mut loaded = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.trim_end().splitn(5, ';').collect();
            if fields.len() < 5 {
                continue;
            }
            let id_digits = fields[0].trim();
            if id_digits.is_empty() {
                continue;
            }
            let id = format!("{:0>7}", id_digits);
            let count: u32 = fields[2].trim().parse().unwrap_or(0);
            let mut name = fields[3].to_string();
            let mut desc = fields[4].to_string();
            if self.make_upper {
                name = name.to_uppercase();
                desc = desc.to_uppercase();
            }
            pad_to(&mut name, 16);
            pad_to(&mut desc, 14);
            loaded.push(Arc::new(TgEntry {
                id,
                kind: TgKind::from_opt(fields[1]),
                count: format!("{:03}", count.min(999)),
                name,
                desc,
            }));
        }
        let total = loaded.len();
        *self.entries.lock() = loaded;
        info!(total, "loaded TGs into the lookup table");
        Ok(total)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current list (cheap: entries are reference counted).
    pub fn snapshot(&self) -> Vec<Arc<TgEntry>> {
        self.entries.lock().clone()
    }

    pub fn find_by_id(&self, id: u32) -> Option<Arc<TgEntry>> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.id_number() == id)
            .cloned()
    }

    /// Resolve a 5-digit handset selection to the full id/kind/count.
    pub fn resolve(&self, id: u32) -> Resolved {
        let wanted = format!("{:05}", id);
        for entry in self.entries.lock().iter() {
            if entry.short_id() == wanted {
                return Resolved {
                    kind: entry.kind,
                    full_id: entry.id.parse().unwrap_or(id),
                    count: entry.count.parse().unwrap_or(0),
                };
            }
        }
        Resolved { kind: TgKind::Group, full_id: id, count: 0 }
    }

    /// Prefix search on the (trimmed, uppercased) name, sorted by name.
    pub fn search(&self, name: &str) -> Vec<Arc<TgEntry>> {
        let wanted = name.trim().to_uppercase();
        let mut found: Vec<Arc<TgEntry>> = self
            .entries
            .lock()
            .iter()
            .filter(|e| e.name.trim().to_uppercase().starts_with(&wanted))
            .cloned()
            .collect();
        found.sort_by(|x, y| x.name.to_uppercase().cmp(&y.name.to_uppercase()));
        found
    }

    /// Spawn the periodic reload thread.
    pub fn start_reload(self: &Arc<Self>, minutes: u64) {
        if minutes == 0 {
            return;
        }
        let registry = Arc::clone(self);
        thread::Builder::new()
            .name("tglist-reload".into())
            .spawn(move || loop {
                thread::sleep(Duration::from_secs(minutes * 60));
                if let Err(e) = registry.load() {
                    warn!(error = %e, "TG list reload failed, keeping previous list");
                }
            })
            .expect("spawning the TG reload thread");
    }
}

fn pad_to(s: &mut String, width: usize) {
    s.truncate(width);
    while s.len() < width {
        s.push(' ');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn registry_with(content: &str, upper: bool) -> (tempfile::TempDir, TgRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("TGList.txt");
        let mut file = File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        let registry = TgRegistry::new(&path, upper);
        registry.load().unwrap();
        (dir, registry)
    }

    const SAMPLE: &str = "\
# id;opt;count;name;desc
214;0;25;Spain;Nacional
0021460;1;3;Andalucia;Regional
2147001;2;0;Private One;Someone
bad;line
";

    #[test]
    fn test_load_and_fields() {
        let (_dir, registry) = registry_with(SAMPLE, false);
        assert_eq!(registry.len(), 3);
        let entry = registry.find_by_id(214).unwrap();
        assert_eq!(entry.id, "0000214");
        assert_eq!(entry.short_id(), "00214");
        assert_eq!(entry.count, "025");
        assert_eq!(entry.name.len(), 16);
        assert_eq!(entry.desc.len(), 14);
        assert_eq!(entry.kind, TgKind::Group);
    }

    #[test]
    fn test_resolve_full_id() {
        let (_dir, registry) = registry_with(SAMPLE, false);
        let resolved = registry.resolve(21460);
        assert_eq!(resolved.kind, TgKind::Reflector);
        assert_eq!(resolved.full_id, 21460);
        assert_eq!(resolved.count, 3);

        // Unknown ids fall back to a plain group
        let fallback = registry.resolve(91);
        assert_eq!(fallback.kind, TgKind::Group);
        assert_eq!(fallback.full_id, 91);
        assert_eq!(fallback.count, 0);
    }

    #[test]
    fn test_search_prefix_sorted() {
        let (_dir, registry) = registry_with(SAMPLE, true);
        let hits = registry.search("a");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name.trim(), "ANDALUCIA");
        assert!(registry.search("zz").is_empty());
    }

    #[test]
    fn test_reload_is_idempotent() {
        let (_dir, registry) = registry_with(SAMPLE, false);
        let first = registry.snapshot();
        registry.load().unwrap();
        let second = registry.snapshot();
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.name, b.name);
        }
    }

    #[test]
    fn test_failed_reload_keeps_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("TGList.txt");
        std::fs::write(&path, "214;0;1;Spain;Nacional\n").unwrap();
        let registry = TgRegistry::new(&path, false);
        registry.load().unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(registry.load().is_err());
        assert_eq!(registry.len(), 1);
    }
}
