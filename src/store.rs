//! The in-memory MIB: per-context ordered maps from OID to VarBind.
//!
//! Readers (request dispatch) and writers (updater loops) run on different
//! threads; every operation takes the store lock once and releases it before
//! returning, so a subtree replacement is atomic from any reader's point of
//! view.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Mutex;

use crate::oid::Oid;
use crate::value::VarBind;

/// The empty string is the default context. A `None` context everywhere in
/// the API means this one.
fn context_key(context: Option<&str>) -> String {
    context.unwrap_or("").to_string()
}

#[derive(Debug, Default)]
pub struct DataStore {
    data: Mutex<HashMap<String, BTreeMap<Oid, VarBind>>>,
}

impl DataStore {
    pub fn new() -> Self {
        DataStore::default()
    }

    /// Create the context's map if it does not exist yet. Idempotent.
    pub fn init_context(&self, context: Option<&str>) {
        let mut data = self.data.lock().unwrap();
        data.entry(context_key(context)).or_default();
    }

    /// Atomically replace the whole subtree under `base` in the given
    /// context with exactly `varbinds`: every pre-existing entry at or below
    /// `base` is removed first. This is a replace, not a merge.
    pub fn update(&self, base: &Oid, context: Option<&str>, varbinds: Vec<VarBind>) {
        let mut data = self.data.lock().unwrap();
        let map = data.entry(context_key(context)).or_default();

        map.retain(|oid, _| !base.is_prefix_of(oid));
        for vb in varbinds {
            map.insert(vb.oid.clone(), vb);
        }
    }

    /// Exact-match lookup.
    pub fn get(&self, oid: &Oid, context: Option<&str>) -> Option<VarBind> {
        let data = self.data.lock().unwrap();
        data.get(&context_key(context))?.get(oid).cloned()
    }

    /// The smallest OID strictly greater than `start`, bounded above by
    /// `end` when one is given (an entry equal to `end` is still a hit).
    pub fn get_next(&self, start: &Oid, end: Option<&Oid>, context: Option<&str>) -> Option<Oid> {
        let data = self.data.lock().unwrap();
        let map = data.get(&context_key(context))?;

        let (next, _) = map
            .range((Bound::Excluded(start), Bound::Unbounded))
            .next()?;
        match end {
            Some(end) if next > end => None,
            _ => Some(next.clone()),
        }
    }
}
