//! Weak side structures: identity-keyed weak tables, the debug object id ring, weak
//! reference sets and the delay set used while resolving weak properties.

use std::collections::HashMap;

use crate::object::{ObjectPtr, Slot};

/// Which weak table an entry lives in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum WeakSelector {
    /// Embedder peer pointer attached to an object.
    Peer,
    /// Bytes of external memory charged to an object.
    ExternalSize,
}

impl WeakSelector {
    pub const ALL: [WeakSelector; 2] = [WeakSelector::Peer, WeakSelector::ExternalSize];

    fn index(self) -> usize {
        match self {
            WeakSelector::Peer => 0,
            WeakSelector::ExternalSize => 1,
        }
    }
}

/// Identity-keyed side table. Entries do not keep their key alive.
#[derive(Default)]
pub struct WeakTable {
    entries: HashMap<ObjectPtr, usize>,
}

impl WeakTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: ObjectPtr, value: usize) {
        debug_assert!(key.is_heap_object());
        if value == 0 {
            self.entries.remove(&key);
        } else {
            self.entries.insert(key, value);
        }
    }

    pub fn get(&self, key: ObjectPtr) -> Option<usize> {
        self.entries.get(&key).copied()
    }

    pub fn remove(&mut self, key: ObjectPtr) -> Option<usize> {
        self.entries.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rebuilds the table through `f`: entries mapped to `None` are dropped, the others are
    /// re-keyed to the returned object.
    pub fn rekey(&mut self, mut f: impl FnMut(ObjectPtr) -> Option<ObjectPtr>) {
        let old = std::mem::take(&mut self.entries);
        self.entries.reserve(old.len());
        for (key, value) in old {
            if let Some(key) = f(key) {
                self.entries.insert(key, value);
            }
        }
    }
}

/// One table per [`WeakSelector`].
#[derive(Default)]
pub struct WeakTables {
    tables: [WeakTable; 2],
}

impl WeakTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, selector: WeakSelector) -> &WeakTable {
        &self.tables[selector.index()]
    }

    pub fn table_mut(&mut self, selector: WeakSelector) -> &mut WeakTable {
        &mut self.tables[selector.index()]
    }

    pub fn tables_mut(&mut self) -> &mut [WeakTable] {
        &mut self.tables
    }

    pub fn rekey_all(&mut self, mut f: impl FnMut(ObjectPtr) -> Option<ObjectPtr>) {
        for table in self.tables.iter_mut() {
            table.rekey(&mut f);
        }
    }
}

/// Fixed-capacity ring of objects handed out to debugging clients by id. The scavenger treats
/// it as a root; the marker only keeps entries whose objects survived.
pub struct ObjectIdRing {
    entries: Vec<ObjectPtr>,
    next: usize,
    serial: usize,
}

impl ObjectIdRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: vec![ObjectPtr::NULL; capacity.max(1)],
            next: 0,
            serial: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Records `obj` and returns its id. Ids increase monotonically; an id stays valid until
    /// the ring wraps around over it.
    pub fn add(&mut self, obj: ObjectPtr) -> usize {
        let id = self.serial;
        self.entries[self.next] = obj;
        self.next = (self.next + 1) % self.entries.len();
        self.serial += 1;
        id
    }

    pub fn get(&self, id: usize) -> Option<ObjectPtr> {
        if id >= self.serial || self.serial - id > self.entries.len() {
            return None;
        }
        let obj = self.entries[id % self.entries.len()];
        if obj.is_null() {
            None
        } else {
            Some(obj)
        }
    }

    pub fn visit(&mut self, f: &mut dyn FnMut(Slot)) {
        for entry in self.entries.iter_mut() {
            f(entry as *mut ObjectPtr);
        }
    }
}

/// N keys, M values. If any key is reachable the values are kept alive; keys never are.
#[derive(Default, Debug, Clone)]
pub struct WeakReferenceSet {
    keys: Vec<ObjectPtr>,
    values: Vec<ObjectPtr>,
}

impl WeakReferenceSet {
    pub fn new(keys: Vec<ObjectPtr>, values: Vec<ObjectPtr>) -> Self {
        Self { keys, values }
    }

    pub fn keys(&self) -> &[ObjectPtr] {
        &self.keys
    }

    pub fn values(&self) -> &[ObjectPtr] {
        &self.values
    }

    pub fn visit_keys(&mut self, f: &mut dyn FnMut(Slot)) {
        for key in self.keys.iter_mut() {
            f(key as *mut ObjectPtr);
        }
    }

    pub fn visit_values(&mut self, f: &mut dyn FnMut(Slot)) {
        for value in self.values.iter_mut() {
            f(value as *mut ObjectPtr);
        }
    }

    pub fn visit(&mut self, f: &mut dyn FnMut(Slot)) {
        self.visit_keys(f);
        self.visit_values(f);
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct WeakReferenceSetId(usize);

/// Registered weak reference sets. Sets persist across cycles until removed; dead members are
/// nulled in place.
#[derive(Default)]
pub struct WeakReferenceSets {
    sets: Vec<Option<WeakReferenceSet>>,
}

impl WeakReferenceSets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, set: WeakReferenceSet) -> WeakReferenceSetId {
        self.sets.push(Some(set));
        WeakReferenceSetId(self.sets.len() - 1)
    }

    pub fn get(&self, id: WeakReferenceSetId) -> Option<&WeakReferenceSet> {
        self.sets.get(id.0).and_then(|s| s.as_ref())
    }

    pub fn remove(&mut self, id: WeakReferenceSetId) -> Option<WeakReferenceSet> {
        self.sets.get_mut(id.0).and_then(|s| s.take())
    }

    pub fn len(&self) -> usize {
        self.sets.iter().filter(|s| s.is_some()).count()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WeakReferenceSet> {
        self.sets.iter_mut().flatten()
    }

    pub fn visit(&mut self, f: &mut dyn FnMut(Slot)) {
        for set in self.iter_mut() {
            set.visit(f);
        }
    }
}

/// The collector-specific half of weak reference set resolution.
pub trait WeakResolver {
    /// Whether `key` is already known to be reachable.
    fn is_live(&mut self, key: ObjectPtr) -> bool;
    /// Makes the object in `slot` reachable, updating the slot if the object moves.
    fn keep_alive(&mut self, slot: Slot);
    /// Processes everything reachable from objects kept alive so far.
    fn drain(&mut self);
}

/// Resolves weak reference sets to a fixed point.
///
/// Each round scans the pending queue: a set with a live key has its values kept alive and
/// counts as progress, the others go to the retry queue. Rounds repeat while progress
/// happens. Returns the number of sets that stayed unresolved.
pub fn resolve_weak_reference_sets(
    sets: &mut WeakReferenceSets,
    resolver: &mut dyn WeakResolver,
) -> usize {
    let mut pending: Vec<&mut WeakReferenceSet> = sets.iter_mut().collect();
    let mut rounds = 0;
    loop {
        resolver.drain();
        rounds += 1;
        let mut progress = false;
        let mut retry = Vec::with_capacity(pending.len());
        for set in pending {
            let live = set
                .keys
                .iter()
                .any(|&key| key.is_heap_object() && resolver.is_live(key));
            if live {
                set.visit_values(&mut |slot| resolver.keep_alive(slot));
                progress = true;
            } else {
                retry.push(set);
            }
        }
        pending = retry;
        if !progress || pending.is_empty() {
            break;
        }
    }
    resolver.drain();
    log::trace!(
        "[gc] weak reference sets: {} unresolved after {} rounds",
        pending.len(),
        rounds
    );
    pending.len()
}

/// Weak properties waiting for their key, keyed by the key's address.
#[derive(Default)]
pub struct DelaySet {
    delayed: HashMap<usize, Vec<ObjectPtr>>,
    len: usize,
}

impl DelaySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: ObjectPtr, property: ObjectPtr) {
        self.delayed.entry(key.addr()).or_default().push(property);
        self.len += 1;
    }

    /// Removes and returns the properties waiting on `key`.
    pub fn take(&mut self, key: ObjectPtr) -> Option<Vec<ObjectPtr>> {
        let properties = self.delayed.remove(&key.addr())?;
        self.len -= properties.len();
        Some(properties)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Removes every entry, returning the keys and their properties.
    pub fn drain(&mut self) -> Vec<(ObjectPtr, Vec<ObjectPtr>)> {
        self.len = 0;
        self.delayed
            .drain()
            .map(|(addr, props)| (ObjectPtr::from_addr(addr), props))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn weak_table_rekey_drops_and_moves() {
        let mut table = WeakTable::new();
        let a = ObjectPtr::from_addr(0x1000);
        let b = ObjectPtr::from_addr(0x2000);
        table.set(a, 1);
        table.set(b, 2);
        table.rekey(|key| if key == a { Some(ObjectPtr::from_addr(0x3000)) } else { None });
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(ObjectPtr::from_addr(0x3000)), Some(1));
        assert_eq!(table.get(b), None);
    }

    #[test]
    fn id_ring_wraps() {
        let mut ring = ObjectIdRing::new(2);
        let a = ring.add(ObjectPtr::from_addr(0x10));
        let b = ring.add(ObjectPtr::from_addr(0x20));
        let c = ring.add(ObjectPtr::from_addr(0x30));
        assert_eq!(ring.get(a), None);
        assert_eq!(ring.get(b), Some(ObjectPtr::from_addr(0x20)));
        assert_eq!(ring.get(c), Some(ObjectPtr::from_addr(0x30)));
        assert_eq!(ring.get(c + 1), None);
    }

    #[test]
    fn delay_set_take_and_drain() {
        let mut set = DelaySet::new();
        let a = ObjectPtr::from_addr(0x100);
        let b = ObjectPtr::from_addr(0x400);
        set.insert(a, ObjectPtr::from_addr(0x200));
        set.insert(a, ObjectPtr::from_addr(0x300));
        set.insert(b, ObjectPtr::from_addr(0x500));
        assert_eq!(set.len(), 3);
        let props = set.take(a).unwrap();
        assert_eq!(props, vec![ObjectPtr::from_addr(0x200), ObjectPtr::from_addr(0x300)]);
        assert_eq!(set.len(), 1);
        assert!(set.take(a).is_none());
        let rest = set.drain();
        assert_eq!(rest, vec![(b, vec![ObjectPtr::from_addr(0x500)])]);
        assert!(set.is_empty());
    }

    /// Objects are live once kept alive; `edges` makes keeping one alive reach others.
    struct GraphResolver {
        live: HashSet<ObjectPtr>,
        edges: Vec<(ObjectPtr, ObjectPtr)>,
        drains: usize,
    }

    impl WeakResolver for GraphResolver {
        fn is_live(&mut self, key: ObjectPtr) -> bool {
            self.live.contains(&key)
        }
        fn keep_alive(&mut self, slot: Slot) {
            self.live.insert(unsafe { *slot });
        }
        fn drain(&mut self) {
            self.drains += 1;
            loop {
                let before = self.live.len();
                for &(from, to) in &self.edges {
                    if self.live.contains(&from) {
                        self.live.insert(to);
                    }
                }
                if self.live.len() == before {
                    break;
                }
            }
        }
    }

    #[test]
    fn weak_sets_resolve_in_chain_and_leave_dead_sets() {
        let obj = |n: usize| ObjectPtr::from_addr(n * 16);
        let mut sets = WeakReferenceSets::new();
        // Listed in reverse so each round resolves exactly one more link.
        sets.add(WeakReferenceSet::new(vec![obj(3)], vec![obj(4)]));
        sets.add(WeakReferenceSet::new(vec![obj(2)], vec![obj(3)]));
        sets.add(WeakReferenceSet::new(vec![obj(1)], vec![obj(2)]));
        sets.add(WeakReferenceSet::new(vec![obj(9)], vec![obj(10)]));
        let mut resolver = GraphResolver {
            live: [obj(1)].iter().copied().collect(),
            edges: vec![],
            drains: 0,
        };
        let unresolved = resolve_weak_reference_sets(&mut sets, &mut resolver);
        assert_eq!(unresolved, 1);
        assert!(resolver.live.contains(&obj(4)));
        assert!(!resolver.live.contains(&obj(10)));
    }
}
