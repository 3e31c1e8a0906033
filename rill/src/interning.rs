use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

/// Interned string key. Ids are dense and stable for the lifetime of the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InternedId(u32);

impl InternedId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

struct InternedStringsImpl {
    table: Vec<Arc<str>>,
    mappings: AHashMap<Arc<str>, InternedId>,
}

/// VM-wide string table shared by every process.
///
/// Member keys, identifiers and string literals in tapes are all interned so
/// that member maps can be keyed by a `u32`.
#[derive(Clone)]
pub struct InternedStrings(Arc<RwLock<InternedStringsImpl>>);

impl InternedStringsImpl {
    fn new() -> Self {
        Self {
            table: Vec::new(),
            mappings: AHashMap::new(),
        }
    }

    fn get_or_add(&mut self, value: &str) -> InternedId {
        if let Some(&id) = self.mappings.get(value) {
            return id;
        }
        let id = InternedId(self.table.len() as u32);
        let interned = Arc::<str>::from(value);
        self.mappings.insert(interned.clone(), id);
        self.table.push(interned);
        id
    }
}

impl InternedStrings {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(InternedStringsImpl::new())))
    }

    pub fn add(&self, value: &str) -> InternedId {
        // fast path: most lookups hit an existing entry
        if let Some(&id) = self.0.read().mappings.get(value) {
            return id;
        }
        self.0.write().get_or_add(value)
    }

    pub fn lookup(&self, value: &str) -> Option<InternedId> {
        self.0.read().mappings.get(value).copied()
    }

    pub fn get(&self, id: InternedId) -> Arc<str> {
        // ids are only ever handed out by this table
        self.0.read().table[id.index()].clone()
    }

    pub fn len(&self) -> usize {
        self.0.read().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InternedStrings {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InternedStrings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternedStrings")
            .field("len", &self.len())
            .finish()
    }
}

/// Names the runtime looks up by key on hot paths.
#[derive(Debug, Clone, Copy)]
pub struct WellKnown {
    pub self_: InternedId,
    pub new: InternedId,
    pub index: InternedId,
    pub set: InternedId,
    pub message: InternedId,
    pub stacktrace: InternedId,
    pub module: InternedId,
    pub function: InternedId,
    pub line: InternedId,
    pub col: InternedId,
    pub text: InternedId,
    pub value: InternedId,
    pub builtins: InternedId,
}

impl WellKnown {
    pub fn new(strings: &InternedStrings) -> Self {
        Self {
            self_: strings.add("self"),
            new: strings.add("new"),
            index: strings.add("__index__"),
            set: strings.add("__set__"),
            message: strings.add("message"),
            stacktrace: strings.add("stacktrace"),
            module: strings.add("module"),
            function: strings.add("function"),
            line: strings.add("line"),
            col: strings.add("col"),
            text: strings.add("text"),
            value: strings.add("value"),
            builtins: strings.add("builtins"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_string_interns_to_same_id() {
        let strings = InternedStrings::new();
        let a = strings.add("counter");
        let b = strings.add("counter");
        let c = strings.add("other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(&*strings.get(c), "other");
    }

    #[test]
    fn clones_share_the_table() {
        let strings = InternedStrings::new();
        let clone = strings.clone();
        let id = clone.add("shared");
        assert_eq!(strings.lookup("shared"), Some(id));
        assert_eq!(strings.lookup("missing"), None);
    }

    #[test]
    fn concurrent_interning_agrees() {
        let strings = InternedStrings::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let strings = strings.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|i| strings.add(&format!("name{i}")))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let results: Vec<_> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        for r in &results[1..] {
            assert_eq!(r, &results[0]);
        }
        assert_eq!(strings.len(), 100);
    }
}
