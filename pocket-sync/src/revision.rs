use std::cmp::Ordering;
use xxhash_rust::xxh3::xxh3_64;

/// Parsed `<sequence>-<hash>` revision identifier.
///
/// Parsing is lenient by contract: anything that does not match the format is
/// `None`, never an error, so callers fall back to vector-clock decisions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Revision {
    pub seq: u64,
    pub hash: String,
}

impl Revision {
    /// Parses `^([0-9]+)-([A-Za-z0-9]+)$`. Rejects empty parts, non-digits,
    /// out-of-range sequences and non-alphanumeric hashes.
    pub fn parse(s: &str) -> Option<Revision> {
        let (seq, hash) = s.split_once('-')?;
        if seq.is_empty() || hash.is_empty() {
            return None;
        }
        if !seq.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if !hash.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return None;
        }
        let seq = seq.parse::<u64>().ok()?;
        Some(Revision {
            seq,
            hash: hash.to_string(),
        })
    }

    /// Mints a revision string for `content` at the given sequence.
    pub fn mint(seq: u64, content: &serde_json::Value) -> String {
        let bytes = serde_json::to_vec(content).unwrap_or_default();
        format!("{}-{:016x}", seq, xxh3_64(&bytes))
    }

    /// Compares two revision strings: numeric sequence first, lexical hash
    /// second. `None` when either side is malformed.
    pub fn compare(a: &str, b: &str) -> Option<Ordering> {
        let a = Revision::parse(a)?;
        let b = Revision::parse(b)?;
        Some(a.seq.cmp(&b.seq).then_with(|| a.hash.cmp(&b.hash)))
    }

    /// Sequence of a revision string, zero when malformed. Used when minting
    /// a successor for a merged document.
    pub fn seq_of(s: &str) -> u64 {
        Revision::parse(s).map(|r| r.seq).unwrap_or(0)
    }
}
