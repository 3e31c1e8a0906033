use std::sync::Arc;

use ahash::{AHashMap, AHashSet};

use crate::{
    ClassId, ContextId, Entity, FunctionId, Internal, InternedId, ModuleId,
    Object, ObjectRef, Registry, RuntimeError, RuntimeResult, TaskId,
    VmError, Visitable,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct HeapCreateInfo {
    pub max_object_count: Option<usize>,
    pub initial_threshold: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapSettings {
    /// Live objects allowed after a collection before the process is out of
    /// memory.
    pub max_object_count: usize,
    /// Live count that triggers the first collection.
    pub initial_threshold: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            max_object_count: 1_000_000,
            initial_threshold: 500_000,
        }
    }
}

impl HeapCreateInfo {
    pub fn settings(&self) -> Result<HeapSettings, VmError> {
        let mut settings = HeapSettings::default();
        self.max_object_count.inspect(|&val| {
            settings.max_object_count = val;
            settings.initial_threshold = val / 2;
        });
        self.initial_threshold
            .inspect(|&val| settings.initial_threshold = val);
        if settings.max_object_count == 0 {
            return Err(VmError::InvalidSettings("max_object_count must be positive"));
        }
        if settings.initial_threshold > settings.max_object_count {
            return Err(VmError::InvalidSettings(
                "initial_threshold exceeds max_object_count",
            ));
        }
        Ok(settings)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub allocated: u64,
    pub reclaimed: u64,
    pub collections: u64,
    /// Objects whose last incoming edge went away while unrooted.
    pub candidates: u64,
}

/// Per-heap reflection singletons, keyed by what they reflect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reflected {
    Class(ClassId),
    Module(ModuleId),
    Function(FunctionId),
}

/// Process-local state an object's payload keeps alive without a heap edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum External {
    /// A captured context and everything up its lexical chain.
    Context(ContextId),
    /// A task whose result has not been memoized yet.
    Task(TaskId),
}

impl Internal {
    pub fn external(&self) -> Option<External> {
        match self {
            Internal::FunctionRef(bound) => bound.capture.map(External::Context),
            Internal::Future(cell) if !cell.memoized => {
                Some(External::Task(cell.task))
            }
            _ => None,
        }
    }
}

/// Supplies everything that keeps objects alive from outside the heap:
/// task stacks, registers, context bindings and error slots.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(Entity));

    /// Entities held by process-local state an object refers to.
    fn visit_external(
        &mut self,
        external: External,
        visitor: &mut dyn FnMut(Entity),
    );
}

struct Entry {
    object: Object,
    /// Incoming edges as a multiset: parent -> number of slots holding us.
    parents: AHashMap<ObjectRef, u32>,
    roots: u32,
    marked: bool,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Object arena of one process.
///
/// Every container slot holding an object is mirrored by a parent -> child
/// edge. Edges are maintained eagerly on each write; reclamation happens in
/// [`Heap::collect_garbage`], which traces from the roots so cycles go too.
pub struct Heap {
    registry: Arc<Registry>,
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    threshold: usize,
    settings: HeapSettings,
    pending: AHashSet<ObjectRef>,
    reflections: AHashMap<Reflected, ObjectRef>,
    stats: HeapStats,
}

impl Heap {
    pub fn new(settings: HeapSettings, registry: Arc<Registry>) -> Self {
        Self {
            registry,
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            threshold: settings.initial_threshold,
            settings,
            pending: AHashSet::new(),
            reflections: AHashMap::new(),
            stats: HeapStats::default(),
        }
    }

    pub fn settings(&self) -> HeapSettings {
        self.settings
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    // ── slot access ─────────────────────────────────────────────────

    fn entry(&self, r: ObjectRef) -> RuntimeResult<&Entry> {
        match self.slots.get(r.index as usize) {
            Some(Slot {
                generation,
                entry: Some(entry),
            }) if *generation == r.generation => Ok(entry),
            _ => Err(RuntimeError::StaleReference),
        }
    }

    fn entry_mut(&mut self, r: ObjectRef) -> RuntimeResult<&mut Entry> {
        match self.slots.get_mut(r.index as usize) {
            Some(Slot {
                generation,
                entry: Some(entry),
            }) if *generation == r.generation => Ok(entry),
            _ => Err(RuntimeError::StaleReference),
        }
    }

    pub fn is_live(&self, r: ObjectRef) -> bool {
        self.entry(r).is_ok()
    }

    pub fn get(&self, r: ObjectRef) -> RuntimeResult<&Object> {
        self.entry(r).map(|e| &e.object)
    }

    pub fn class_of(&self, r: ObjectRef) -> RuntimeResult<ClassId> {
        self.get(r).map(Object::class)
    }

    pub fn member(&self, r: ObjectRef, key: InternedId) -> RuntimeResult<Option<Entity>> {
        self.get(r).map(|o| o.member(key))
    }

    fn check_child(&self, value: Entity) -> RuntimeResult<()> {
        if let Entity::Object(child) = value {
            self.entry(child)?;
        }
        Ok(())
    }

    // ── allocation ──────────────────────────────────────────────────

    /// Allocate an empty object of `class`, running the class init hook.
    pub fn allocate(&mut self, class: ClassId) -> ObjectRef {
        let mut object = Object::new(class);
        if let Some(init) = self.registry.class(class).hooks.init {
            init(&mut object);
        }
        let entry = Entry {
            object,
            parents: AHashMap::new(),
            roots: 0,
            marked: false,
        };
        self.live += 1;
        self.stats.allocated += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                ObjectRef {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                ObjectRef {
                    index,
                    generation: 0,
                }
            }
        }
    }

    pub fn new_string(&mut self, class: ClassId, value: impl Into<String>) -> ObjectRef {
        let r = self.allocate(class);
        if let Some(slot) = self.slots[r.index as usize].entry.as_mut() {
            slot.object.internal = Internal::String(value.into());
        }
        r
    }

    pub fn new_array(
        &mut self,
        class: ClassId,
        items: Vec<Entity>,
    ) -> RuntimeResult<ObjectRef> {
        let r = self.allocate(class);
        self.replace_internal(r, Internal::Array(items))?;
        Ok(r)
    }

    pub fn new_tuple(
        &mut self,
        class: ClassId,
        items: Vec<Entity>,
    ) -> RuntimeResult<ObjectRef> {
        let r = self.allocate(class);
        self.replace_internal(r, Internal::Tuple(items.into_boxed_slice()))?;
        Ok(r)
    }

    // ── edges ───────────────────────────────────────────────────────

    pub fn inc_edge(&mut self, parent: ObjectRef, child: ObjectRef) -> RuntimeResult<()> {
        let entry = self.entry_mut(child)?;
        *entry.parents.entry(parent).or_insert(0) += 1;
        self.pending.remove(&child);
        Ok(())
    }

    /// Drop one edge. A child left without parents and roots becomes a
    /// collection candidate; it may still be held by a stack or register,
    /// so only the next trace decides.
    pub fn dec_edge(&mut self, parent: ObjectRef, child: ObjectRef) -> RuntimeResult<()> {
        let entry = self.entry_mut(child)?;
        match entry.parents.get_mut(&parent) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                entry.parents.remove(&parent);
            }
            None => {
                debug_assert!(false, "dec_edge without a matching edge");
                return Ok(());
            }
        }
        if entry.parents.is_empty() && entry.roots == 0 {
            self.pending.insert(child);
            self.stats.candidates += 1;
        }
        Ok(())
    }

    pub fn incoming_edges(&self, r: ObjectRef) -> RuntimeResult<usize> {
        self.entry(r)
            .map(|e| e.parents.values().map(|&n| n as usize).sum())
    }

    pub fn edge_count(&self, parent: ObjectRef, child: ObjectRef) -> RuntimeResult<u32> {
        self.entry(child)
            .map(|e| e.parents.get(&parent).copied().unwrap_or(0))
    }

    // ── edge-maintaining writes ─────────────────────────────────────

    pub fn set_member(
        &mut self,
        parent: ObjectRef,
        key: InternedId,
        value: Entity,
    ) -> RuntimeResult<()> {
        self.check_child(value)?;
        let old = self.entry_mut(parent)?.object.members.insert(key, value);
        if let Some(old) = old {
            if old.same_object(value) {
                return Ok(());
            }
            if let Entity::Object(old) = old {
                self.dec_edge(parent, old)?;
            }
        }
        if let Entity::Object(child) = value {
            self.inc_edge(parent, child)?;
        }
        Ok(())
    }

    pub fn remove_member(
        &mut self,
        parent: ObjectRef,
        key: InternedId,
    ) -> RuntimeResult<Option<Entity>> {
        let old = self.entry_mut(parent)?.object.members.remove(&key);
        if let Some(Entity::Object(child)) = old {
            self.dec_edge(parent, child)?;
        }
        Ok(old)
    }

    /// Swap the payload, moving every edge it carries. Returns the old one.
    pub fn replace_internal(
        &mut self,
        r: ObjectRef,
        internal: Internal,
    ) -> RuntimeResult<Internal> {
        let mut added = Vec::new();
        internal.visit_edges(&mut |c| added.push(c));
        for &child in &added {
            self.entry(child)?;
        }
        let old = std::mem::replace(&mut self.entry_mut(r)?.object.internal, internal);
        for child in added {
            self.inc_edge(r, child)?;
        }
        let mut removed = Vec::new();
        old.visit_edges(&mut |c| removed.push(c));
        for child in removed {
            self.dec_edge(r, child)?;
        }
        Ok(old)
    }

    /// Replace a payload that carries no entities.
    pub fn set_plain_internal(&mut self, r: ObjectRef, internal: Internal) -> RuntimeResult<()> {
        if internal.carries_entities() {
            self.replace_internal(r, internal)?;
            return Ok(());
        }
        let entry = self.entry_mut(r)?;
        if entry.object.internal.carries_entities() {
            self.replace_internal(r, internal)?;
        } else {
            entry.object.internal = internal;
        }
        Ok(())
    }

    pub fn array_push(&mut self, r: ObjectRef, value: Entity) -> RuntimeResult<usize> {
        self.check_child(value)?;
        let len = match &mut self.entry_mut(r)?.object.internal {
            Internal::Array(items) => {
                items.push(value);
                items.len()
            }
            _ => return Err(not_a(r, "Array")),
        };
        if let Entity::Object(child) = value {
            self.inc_edge(r, child)?;
        }
        Ok(len)
    }

    pub fn array_pop(&mut self, r: ObjectRef) -> RuntimeResult<Option<Entity>> {
        let popped = match &mut self.entry_mut(r)?.object.internal {
            Internal::Array(items) => items.pop(),
            _ => return Err(not_a(r, "Array")),
        };
        if let Some(Entity::Object(child)) = popped {
            self.dec_edge(r, child)?;
        }
        Ok(popped)
    }

    /// Store into an existing array or tuple slot.
    pub fn slot_set(&mut self, r: ObjectRef, index: i64, value: Entity) -> RuntimeResult<()> {
        self.check_child(value)?;
        let old = {
            let items: &mut [Entity] = match &mut self.entry_mut(r)?.object.internal {
                Internal::Array(items) => items,
                Internal::Tuple(items) => items,
                _ => return Err(not_a(r, "Array or Tuple")),
            };
            let len = items.len();
            let slot = usize::try_from(index)
                .ok()
                .and_then(|i| items.get_mut(i))
                .ok_or(RuntimeError::IndexOutOfBounds { index, len })?;
            std::mem::replace(slot, value)
        };
        if old.same_object(value) {
            return Ok(());
        }
        if let Entity::Object(child) = old {
            self.dec_edge(r, child)?;
        }
        if let Entity::Object(child) = value {
            self.inc_edge(r, child)?;
        }
        Ok(())
    }

    pub fn slot_get(&self, r: ObjectRef, index: i64) -> RuntimeResult<Entity> {
        let items = match self.get(r)?.internal() {
            Internal::Array(items) => &items[..],
            Internal::Tuple(items) => &items[..],
            _ => return Err(not_a(r, "Array or Tuple")),
        };
        usize::try_from(index)
            .ok()
            .and_then(|i| items.get(i).copied())
            .ok_or(RuntimeError::IndexOutOfBounds {
                index,
                len: items.len(),
            })
    }

    // ── roots and reflection ────────────────────────────────────────

    pub fn root(&mut self, r: ObjectRef) -> RuntimeResult<()> {
        self.entry_mut(r)?.roots += 1;
        self.pending.remove(&r);
        Ok(())
    }

    pub fn unroot(&mut self, r: ObjectRef) -> RuntimeResult<()> {
        let entry = self.entry_mut(r)?;
        entry.roots = entry.roots.saturating_sub(1);
        if entry.roots == 0 && entry.parents.is_empty() {
            self.pending.insert(r);
        }
        Ok(())
    }

    pub fn is_rooted(&self, r: ObjectRef) -> bool {
        self.entry(r).map(|e| e.roots > 0).unwrap_or(false)
    }

    pub fn reflection(&self, key: Reflected) -> Option<ObjectRef> {
        self.reflections.get(&key).copied()
    }

    /// Remember a reflection singleton. It stays rooted for the life of the
    /// heap.
    pub fn register_reflection(&mut self, key: Reflected, r: ObjectRef) -> RuntimeResult<()> {
        self.root(r)?;
        if let Some(previous) = self.reflections.insert(key, r) {
            self.unroot(previous)?;
        }
        Ok(())
    }

    // ── collection ──────────────────────────────────────────────────

    pub fn should_collect(&self) -> bool {
        self.live >= self.threshold
    }

    /// Trace from every root and reclaim the rest. Returns how many objects
    /// were reclaimed.
    pub fn collect_garbage(&mut self, roots: &mut dyn RootProvider) -> usize {
        let mut worklist = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(entry) = slot.entry.as_mut() {
                entry.marked = false;
                if entry.roots > 0 {
                    worklist.push(ObjectRef {
                        index: index as u32,
                        generation: slot.generation,
                    });
                }
            }
        }
        roots.visit_roots(&mut |e| {
            if let Entity::Object(r) = e {
                worklist.push(r);
            }
        });

        while let Some(r) = worklist.pop() {
            let Ok(entry) = self.entry_mut(r) else {
                continue;
            };
            if entry.marked {
                continue;
            }
            entry.marked = true;
            entry.object.visit_edges(&mut |child| worklist.push(child));
            if let Some(external) = entry.object.internal.external() {
                roots.visit_external(external, &mut |e| {
                    if let Entity::Object(r) = e {
                        worklist.push(r);
                    }
                });
            }
        }

        let dead: Vec<ObjectRef> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match &slot.entry {
                Some(entry) if !entry.marked => Some(ObjectRef {
                    index: index as u32,
                    generation: slot.generation,
                }),
                _ => None,
            })
            .collect();

        for &r in &dead {
            let slot = &mut self.slots[r.index as usize];
            let Some(mut entry) = slot.entry.take() else {
                continue;
            };
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(r.index);
            self.live -= 1;

            if let Some(delete) = self.registry.class(entry.object.class()).hooks.delete {
                delete(&mut entry.object);
            }
            // survivors lose every edge from the dead parent
            let mut children = Vec::new();
            entry.object.visit_edges(&mut |c| children.push(c));
            for child in children {
                if let Ok(child) = self.entry_mut(child) {
                    child.parents.remove(&r);
                }
            }
        }

        self.pending.clear();
        self.stats.collections += 1;
        self.stats.reclaimed += dead.len() as u64;
        self.settle_threshold();
        log::debug!(
            "gc: reclaimed {} objects, {} live, next threshold {}",
            dead.len(),
            self.live,
            self.threshold
        );
        dead.len()
    }

    /// Post-collection threshold: back to half the limit when occupancy is
    /// low, otherwise halfway between the live count and the limit. Past
    /// the limit a quarter of it is granted as headroom, so a handler for
    /// the out-of-memory error gets to run before the next collection.
    fn settle_threshold(&mut self) {
        let max = self.settings.max_object_count;
        let half = max / 2;
        self.threshold = if self.live < half {
            half
        } else if self.live <= max {
            ((self.live + max) / 2).max(self.live + 1)
        } else {
            self.live + (max / 4).max(1)
        };
    }

    /// The out-of-memory error to raise when the last collection left more
    /// live objects than allowed.
    pub fn over_limit(&self) -> Option<RuntimeError> {
        (self.live > self.settings.max_object_count).then_some(RuntimeError::OutOfMemory {
            live: self.live,
            max: self.settings.max_object_count,
        })
    }

    /// Recompute every incoming-edge multiset from the live containers and
    /// compare it with the recorded graph.
    pub fn audit_edges(&self) -> Result<(), String> {
        let mut expected: AHashMap<ObjectRef, AHashMap<ObjectRef, u32>> = AHashMap::new();
        for (index, slot) in self.slots.iter().enumerate() {
            let Some(entry) = &slot.entry else { continue };
            let parent = ObjectRef {
                index: index as u32,
                generation: slot.generation,
            };
            entry.object.visit_edges(&mut |child| {
                *expected.entry(child).or_default().entry(parent).or_insert(0) += 1;
            });
        }
        for (index, slot) in self.slots.iter().enumerate() {
            let Some(entry) = &slot.entry else { continue };
            let r = ObjectRef {
                index: index as u32,
                generation: slot.generation,
            };
            let want = expected.remove(&r).unwrap_or_default();
            if want != entry.parents {
                return Err(format!(
                    "object {}:{} records parents {:?}, containers hold {:?}",
                    r.index, r.generation, entry.parents, want
                ));
            }
        }
        if let Some((child, _)) = expected.into_iter().next() {
            return Err(format!(
                "dangling edge to reclaimed object {}:{}",
                child.index, child.generation
            ));
        }
        Ok(())
    }

    pub fn live_objects(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|_| ObjectRef {
                index: index as u32,
                generation: slot.generation,
            })
        })
    }
}

fn not_a(r: ObjectRef, what: &'static str) -> RuntimeError {
    RuntimeError::TypeError {
        expected: what,
        got: format!("object {}", r.index),
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("live", &self.live)
            .field("threshold", &self.threshold)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClassHooks, InternedStrings, Tape};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DELETED: AtomicUsize = AtomicUsize::new(0);

    fn count_delete(_: &mut Object) {
        DELETED.fetch_add(1, Ordering::SeqCst);
    }

    struct Fixture {
        strings: InternedStrings,
        heap: Heap,
        plain: ClassId,
        counted: ClassId,
    }

    fn fixture(settings: HeapSettings) -> Fixture {
        let strings = InternedStrings::new();
        let registry = Arc::new(Registry::new());
        let module = registry
            .add_module(&strings, "test", Tape::default())
            .expect("module");
        let plain = registry.add_class(
            strings.add("Plain"),
            module,
            None,
            Vec::new(),
            ClassHooks::default(),
        );
        let counted = registry.add_class(
            strings.add("Counted"),
            module,
            None,
            Vec::new(),
            ClassHooks {
                init: None,
                delete: Some(count_delete),
            },
        );
        Fixture {
            strings,
            heap: Heap::new(settings, registry),
            plain,
            counted,
        }
    }

    struct NoRoots;

    impl RootProvider for NoRoots {
        fn visit_roots(&mut self, _: &mut dyn FnMut(Entity)) {}
        fn visit_external(&mut self, _: External, _: &mut dyn FnMut(Entity)) {}
    }

    struct Roots(Vec<Entity>);

    impl RootProvider for Roots {
        fn visit_roots(&mut self, visitor: &mut dyn FnMut(Entity)) {
            self.0.iter().for_each(|&e| visitor(e));
        }
        fn visit_external(&mut self, _: External, _: &mut dyn FnMut(Entity)) {}
    }

    #[test]
    fn overwriting_members_moves_edges() {
        let mut f = fixture(HeapSettings::default());
        let a = f.strings.add("a");
        let b = f.strings.add("b");
        let parent = f.heap.allocate(f.plain);
        let x = f.heap.allocate(f.plain);
        let y = f.heap.allocate(f.plain);

        f.heap.set_member(parent, a, x.into()).unwrap();
        f.heap.set_member(parent, b, x.into()).unwrap();
        assert_eq!(f.heap.edge_count(parent, x).unwrap(), 2);

        // same identity: no churn
        f.heap.set_member(parent, a, x.into()).unwrap();
        assert_eq!(f.heap.edge_count(parent, x).unwrap(), 2);

        f.heap.set_member(parent, a, y.into()).unwrap();
        assert_eq!(f.heap.edge_count(parent, x).unwrap(), 1);
        assert_eq!(f.heap.edge_count(parent, y).unwrap(), 1);

        f.heap.set_member(parent, b, Entity::int(4)).unwrap();
        assert_eq!(f.heap.incoming_edges(x).unwrap(), 0);
        assert_eq!(f.heap.pending_candidates(), 1);
        f.heap.audit_edges().unwrap();
    }

    #[test]
    fn array_and_tuple_slots_track_edges() {
        let mut f = fixture(HeapSettings::default());
        let child = f.heap.allocate(f.plain);
        let arr = f.heap.new_array(f.plain, vec![child.into(), child.into()]).unwrap();
        let tup = f.heap.new_tuple(f.plain, vec![Entity::None, child.into()]).unwrap();
        assert_eq!(f.heap.incoming_edges(child).unwrap(), 3);

        f.heap.slot_set(arr, 0, Entity::int(1)).unwrap();
        f.heap.slot_set(tup, 0, child.into()).unwrap();
        assert_eq!(f.heap.edge_count(arr, child).unwrap(), 1);
        assert_eq!(f.heap.edge_count(tup, child).unwrap(), 2);

        assert_eq!(f.heap.array_pop(arr).unwrap(), Some(child.into()));
        f.heap.array_push(arr, tup.into()).unwrap();
        assert_eq!(f.heap.edge_count(arr, child).unwrap(), 0);
        assert!(matches!(
            f.heap.slot_set(arr, 9, Entity::None),
            Err(RuntimeError::IndexOutOfBounds { index: 9, len: 2 })
        ));
        f.heap.audit_edges().unwrap();
    }

    #[test]
    fn collection_keeps_reachable_and_reclaims_cycles() {
        let mut f = fixture(HeapSettings::default());
        let next = f.strings.add("next");
        DELETED.store(0, Ordering::SeqCst);

        let kept = f.heap.allocate(f.plain);
        let kept_child = f.heap.allocate(f.plain);
        f.heap.set_member(kept, next, kept_child.into()).unwrap();

        // unreachable two-node cycle
        let a = f.heap.allocate(f.counted);
        let b = f.heap.allocate(f.counted);
        f.heap.set_member(a, next, b.into()).unwrap();
        f.heap.set_member(b, next, a.into()).unwrap();
        // unreachable object pointing at a survivor
        let stray = f.heap.allocate(f.counted);
        f.heap.set_member(stray, next, kept_child.into()).unwrap();

        let reclaimed = f.heap.collect_garbage(&mut Roots(vec![kept.into()]));
        assert_eq!(reclaimed, 3);
        assert_eq!(DELETED.load(Ordering::SeqCst), 3);
        assert!(f.heap.is_live(kept) && f.heap.is_live(kept_child));
        assert!(!f.heap.is_live(a) && !f.heap.is_live(stray));
        assert_eq!(f.heap.incoming_edges(kept_child).unwrap(), 1);
        f.heap.audit_edges().unwrap();

        // a second pass finds nothing new and runs no hook twice
        assert_eq!(f.heap.collect_garbage(&mut Roots(vec![kept.into()])), 0);
        assert_eq!(DELETED.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn stale_handles_are_detected() {
        let mut f = fixture(HeapSettings::default());
        let gone = f.heap.allocate(f.plain);
        f.heap.collect_garbage(&mut NoRoots);
        let reused = f.heap.allocate(f.plain);
        assert_eq!(gone.index(), reused.index());
        assert!(matches!(f.heap.get(gone), Err(RuntimeError::StaleReference)));
        assert!(f.heap.get(reused).is_ok());
    }

    #[test]
    fn rooted_objects_survive() {
        let mut f = fixture(HeapSettings::default());
        let pinned = f.heap.allocate(f.plain);
        f.heap.root(pinned).unwrap();
        f.heap.collect_garbage(&mut NoRoots);
        assert!(f.heap.is_live(pinned));
        f.heap.unroot(pinned).unwrap();
        f.heap.collect_garbage(&mut NoRoots);
        assert!(!f.heap.is_live(pinned));
    }

    #[test]
    fn threshold_settles_between_half_and_max() {
        let settings = HeapCreateInfo {
            max_object_count: Some(10),
            initial_threshold: None,
        }
        .settings()
        .unwrap();
        let mut f = fixture(settings);
        assert_eq!(f.heap.threshold(), 5);

        let held: Vec<Entity> = (0..8).map(|_| f.heap.allocate(f.plain).into()).collect();
        assert!(f.heap.should_collect());
        f.heap.collect_garbage(&mut Roots(held.clone()));
        assert_eq!(f.heap.threshold(), 9);
        assert!(f.heap.over_limit().is_none());

        let more: Vec<Entity> = (0..4).map(|_| f.heap.allocate(f.plain).into()).collect();
        let all: Vec<Entity> = held.iter().chain(&more).copied().collect();
        f.heap.collect_garbage(&mut Roots(all));
        assert!(matches!(
            f.heap.over_limit(),
            Some(RuntimeError::OutOfMemory { live: 12, max: 10 })
        ));
        assert_eq!(f.heap.threshold(), 14);

        f.heap.collect_garbage(&mut NoRoots);
        assert_eq!(f.heap.threshold(), 5);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let info = HeapCreateInfo {
            max_object_count: Some(10),
            initial_threshold: Some(11),
        };
        assert!(info.settings().is_err());
        let info = HeapCreateInfo {
            max_object_count: Some(0),
            initial_threshold: None,
        };
        assert!(info.settings().is_err());
    }
}
