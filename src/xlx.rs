//! XLX reflector host list.
//!
//! A hosts file maps reflector numbers to master addresses; entries are
//! `number;address` per line with `#` comments.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XlxReflector {
    pub number: u32,
    pub address: String,
}

/// Load the reflector list from a hosts file.
pub fn load_reflectors(path: &Path) -> io::Result<Vec<XlxReflector>> {
    let file = File::open(path)?;
    let mut reflectors = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.starts_with('#') {
            continue;
        }
        let mut parts = line.trim_end().splitn(2, ';');
        let (Some(number), Some(address)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(number) = number.trim().parse::<u32>() else {
            continue;
        };
        let address = address.trim().to_string();
        if address.is_empty() {
            continue;
        }
        reflectors.push(XlxReflector { number, address });
    }
    Ok(reflectors)
}

/// Find a reflector by number.
pub fn find(reflectors: &[XlxReflector], number: u32) -> Option<&XlxReflector> {
    reflectors.iter().find(|r| r.number == number)
}

/// Destination id addressed by linking to a given XLX module letter.
pub fn module_dst_id(module: &str) -> Option<u32> {
    let letter = module.trim().chars().next()?.to_ascii_uppercase();
    if letter.is_ascii_uppercase() {
        Some(4000 + (letter as u32 - 64))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hosts_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("XLXHosts.txt");
        std::fs::write(&path, "# comment\n950;xlx950.example.net\n12;10.0.0.1\nbad\n").unwrap();
        let reflectors = load_reflectors(&path).unwrap();
        assert_eq!(reflectors.len(), 2);
        assert_eq!(find(&reflectors, 950).unwrap().address, "xlx950.example.net");
        assert!(find(&reflectors, 1).is_none());
    }

    #[test]
    fn test_module_ids() {
        assert_eq!(module_dst_id("A"), Some(4001));
        assert_eq!(module_dst_id("d"), Some(4004));
        assert_eq!(module_dst_id(""), None);
    }
}
