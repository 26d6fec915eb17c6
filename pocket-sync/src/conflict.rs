use crate::change::{Document, now_ms};
use crate::revision::Revision;
use crate::vclock::Causality;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Which side a resolution kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
    Merged,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub document: Document,
    pub winner: Winner,
    /// Reserved for strategies the core cannot decide. Always false for the
    /// built-ins.
    pub needs_manual_resolution: bool,
}

/// Caller-supplied merge with the same contract as the built-in strategies:
/// `(local, remote, base) -> resolved document`, inputs untouched.
pub type MergeFn = dyn Fn(&Document, &Document, Option<&Document>) -> Document + Send + Sync;

#[derive(Clone, Default)]
pub enum Strategy {
    ServerWins,
    ClientWins,
    #[default]
    LastWriteWins,
    Merge,
    Custom(Arc<MergeFn>),
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::ServerWins => "server-wins",
            Strategy::ClientWins => "client-wins",
            Strategy::LastWriteWins => "last-write-wins",
            Strategy::Merge => "merge",
            Strategy::Custom(_) => "custom",
        };
        f.write_str(name)
    }
}

/// Concurrency detection between the local and the remote version of a
/// document.
///
/// The final arm is deliberately lenient: revisions in an unknown format are
/// treated as unknown rather than an error, so only the earlier vector-clock
/// arm can declare a conflict for them.
pub fn in_conflict(local: &Document, remote: &Document) -> bool {
    if let (Some(l), Some(r)) = (&local.rev, &remote.rev) {
        if l == r {
            return false;
        }
    }

    if !local.vclock.is_empty() && !remote.vclock.is_empty() {
        return local.vclock.compare(&remote.vclock) == Causality::Concurrent;
    }

    match (&local.rev, &remote.rev) {
        (Some(_), None) | (None, Some(_)) => true,
        (Some(l), Some(r)) => match (Revision::parse(l), Revision::parse(r)) {
            (Some(a), Some(b)) => a.seq == b.seq,
            _ => false,
        },
        (None, None) => false,
    }
}

/// Resolves a detected conflict under the configured strategy. Inputs are
/// never mutated; the returned document is freshly built.
pub struct Resolver {
    strategy: Strategy,
}

impl Resolver {
    pub fn new(strategy: Strategy) -> Self {
        Resolver { strategy }
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn resolve(
        &self,
        local: &Document,
        remote: &Document,
        base: Option<&Document>,
    ) -> Resolution {
        match &self.strategy {
            Strategy::ServerWins => Resolution {
                document: remote.clone(),
                winner: Winner::Remote,
                needs_manual_resolution: false,
            },
            Strategy::ClientWins => Resolution {
                document: local.clone(),
                winner: Winner::Local,
                needs_manual_resolution: false,
            },
            Strategy::LastWriteWins => {
                let winner = lww_winner(local, remote);
                let document = match winner {
                    Winner::Local => local.clone(),
                    _ => remote.clone(),
                };
                Resolution {
                    document,
                    winner,
                    needs_manual_resolution: false,
                }
            }
            Strategy::Merge => Resolution {
                document: merge_documents(local, remote, base),
                winner: Winner::Merged,
                needs_manual_resolution: false,
            },
            Strategy::Custom(merge) => Resolution {
                document: merge(local, remote, base),
                winner: Winner::Merged,
                needs_manual_resolution: false,
            },
        }
    }
}

/// Larger `updated_at` wins; ties break on a strictly greater vector clock;
/// anything else goes to the server side.
fn lww_winner(local: &Document, remote: &Document) -> Winner {
    if local.updated_at > remote.updated_at {
        return Winner::Local;
    }
    if remote.updated_at > local.updated_at {
        return Winner::Remote;
    }
    match local.vclock.compare(&remote.vclock) {
        Causality::After => Winner::Local,
        _ => Winner::Remote,
    }
}

/// Field-by-field merge. With a known base, a field changed on one side only
/// takes that side; changed on both falls back to last-write-wins per field.
/// Without a base every differing field is decided by last-write-wins.
fn merge_documents(local: &Document, remote: &Document, base: Option<&Document>) -> Document {
    let lww = lww_winner(local, remote);
    let mut fields = Map::new();

    let mut keys: Vec<&String> = local.fields.keys().collect();
    for key in remote.fields.keys() {
        if !local.fields.contains_key(key) {
            keys.push(key);
        }
    }

    for key in keys {
        let l = local.fields.get(key);
        let r = remote.fields.get(key);
        let picked: Option<&Value> = if l == r {
            l
        } else {
            let b = base.and_then(|d| d.fields.get(key));
            match base {
                Some(_) if l == b => r,
                Some(_) if r == b => l,
                // Per-field LWW: only document-level timestamps exist, so
                // the document-level pick decides each contested field.
                _ => match lww {
                    Winner::Local => l,
                    _ => r,
                },
            }
        };
        if let Some(value) = picked {
            fields.insert(key.clone(), value.clone());
        }
    }

    let vclock = local.vclock.merged(&remote.vclock);
    let deleted = match lww {
        Winner::Local => local.deleted,
        _ => remote.deleted,
    };
    let seq = local
        .rev
        .as_deref()
        .map(Revision::seq_of)
        .unwrap_or(0)
        .max(remote.rev.as_deref().map(Revision::seq_of).unwrap_or(0));

    let mut merged = Document {
        id: local.id.clone(),
        rev: None,
        updated_at: now_ms(),
        vclock,
        deleted,
        fields,
    };
    merged.rev = Some(Revision::mint(seq + 1, &merged.content()));
    merged
}
