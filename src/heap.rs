//! GC & object model (spec.md §3 Heap object, §4.6).
//!
//! Objects are tagged by `ObjKind`; lifecycle is tracer GC, not refcounting
//! (grounded on `ouros/src/heap.rs`'s `Heap<T>`/`free_list` shape, adapted
//! from refcounting to tri-color mark-and-sweep per spec.md §4.6 and
//! `original_source/mempool.c`'s per-kind free-pool reuse).
//!
//! Rust's allocator already gives us the "pool-backed allocator" half of
//! spec.md's Allocator & writer component for free — payload bytes
//! (`String`, `Vec<Value>`) are reclaimed by ordinary `Drop` during sweep.
//! What remains to model explicitly is reuse of heap *slots* by kind,
//! which is what `free_lists` below does.

use std::cell::Cell;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::bytecode::code::FunctionId;
use crate::errors::ApeError;
use crate::value::Value;

/// FNV-1a over raw bytes; used to key string/number/bool map entries and to
/// cache string hashes (spec.md §4.6). Not cryptographic, just stable and
/// cheap — matches the scale of a GC-heap hash rather than `ahash`'s
/// randomized seed, which would make hashes non-reproducible across runs.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut h = OFFSET;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(PRIME);
    }
    h
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(u32);

impl HeapId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    String,
    Array,
    Map,
    Function,
    Error,
    External,
}

const NUM_KINDS: usize = 6;

fn kind_slot(kind: ObjKind) -> usize {
    match kind {
        ObjKind::String => 0,
        ObjKind::Array => 1,
        ObjKind::Map => 2,
        ObjKind::Function => 3,
        ObjKind::Error => 4,
        ObjKind::External => 5,
    }
}

#[derive(Debug)]
pub struct StringObj {
    pub bytes: String,
    /// Cached hash; `None` until first hashed (spec.md §3's "0 means
    /// unhashed" sentinel, modeled as `Option` rather than a reserved
    /// magic number since Rust gives us a real null case for free).
    hash: Cell<Option<u64>>,
}

impl StringObj {
    pub fn new(bytes: String) -> Self {
        Self { bytes, hash: Cell::new(None) }
    }

    pub fn hash(&self) -> u64 {
        if let Some(h) = self.hash.get() {
            return h;
        }
        let h = hash_bytes(self.bytes.as_bytes());
        self.hash.set(Some(h));
        h
    }
}

#[derive(Debug, Default)]
pub struct MapObj {
    pub entries: Vec<(Value, Value)>,
    index: AHashMap<u64, SmallVec<[usize; 2]>>,
}

impl MapObj {
    pub fn find(&self, key_hash: u64, mut eq: impl FnMut(&Value) -> bool) -> Option<usize> {
        self.index.get(&key_hash)?.iter().copied().find(|&i| eq(&self.entries[i].0))
    }

    pub fn insert_at(&mut self, idx: usize, value: Value) {
        self.entries[idx].1 = value;
    }

    pub fn push(&mut self, key_hash: u64, key: Value, value: Value) {
        let idx = self.entries.len();
        self.entries.push((key, value));
        self.index.entry(key_hash).or_default().push(idx);
    }
}

/// A compiled function body combined with the free values it closed over
/// (spec.md §3's script-function payload).
#[derive(Debug)]
pub struct FunctionObj {
    pub name: String,
    pub function_id: FunctionId,
    pub num_locals: u16,
    pub num_args: u8,
    pub free_vars: Vec<Value>,
}

#[derive(Debug)]
pub struct ErrorObj {
    pub inner: ApeError,
}

/// Opaque host-owned data (spec.md §3's `{pointer, destroy_fn, copy_fn}`).
/// `clone_fn` stands in for `copy_fn`; `destroy_fn` is simply `Drop` on
/// `data`, since Rust's allocator already reclaims it during sweep.
pub struct ExternalObj {
    pub data: Box<dyn std::any::Any>,
    pub clone_fn: Option<fn(&dyn std::any::Any) -> Box<dyn std::any::Any>>,
}

impl std::fmt::Debug for ExternalObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalObj").finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum ObjData {
    String(StringObj),
    Array(Vec<Value>),
    Map(MapObj),
    Function(FunctionObj),
    Error(ErrorObj),
    External(ExternalObj),
}

impl ObjData {
    pub fn kind(&self) -> ObjKind {
        match self {
            ObjData::String(_) => ObjKind::String,
            ObjData::Array(_) => ObjKind::Array,
            ObjData::Map(_) => ObjKind::Map,
            ObjData::Function(_) => ObjKind::Function,
            ObjData::Error(_) => ObjKind::Error,
            ObjData::External(_) => ObjKind::External,
        }
    }
}

struct Slot {
    /// `None` means the slot is free (on some kind's free list).
    data: Option<ObjData>,
    marked: bool,
}

/// The GC-managed heap. Roots are supplied by the caller (the VM stack,
/// this-stack, active frames' closures, globals, constant pool, and the
/// last-popped value — spec.md §4.6) at each `collect` call.
pub struct Heap {
    slots: Vec<Slot>,
    free_lists: [Vec<u32>; NUM_KINDS],
    allocations_since_sweep: usize,
    pub collect_threshold: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl Heap {
    pub fn new(collect_threshold: usize) -> Self {
        Self {
            slots: Vec::new(),
            free_lists: Default::default(),
            allocations_since_sweep: 0,
            collect_threshold,
        }
    }

    pub fn allocate(&mut self, data: ObjData) -> HeapId {
        self.allocations_since_sweep += 1;
        let kind = data.kind();
        if let Some(idx) = self.free_lists[kind_slot(kind)].pop() {
            self.slots[idx as usize] = Slot { data: Some(data), marked: false };
            return HeapId(idx);
        }
        let idx = self.slots.len() as u32;
        self.slots.push(Slot { data: Some(data), marked: false });
        HeapId(idx)
    }

    pub fn should_collect(&self) -> bool {
        self.allocations_since_sweep >= self.collect_threshold
    }

    pub fn get(&self, id: HeapId) -> &ObjData {
        self.slots[id.index()].data.as_ref().expect("dangling HeapId: slot already swept")
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut ObjData {
        self.slots[id.index()].data.as_mut().expect("dangling HeapId: slot already swept")
    }

    pub fn kind_of(&self, id: HeapId) -> ObjKind {
        self.get(id).kind()
    }

    /// Mark phase (DFS from roots) followed by sweep. White objects
    /// (unreached) are dropped and their slot returned to the free pool
    /// for their kind; reached objects are reset to white for the next
    /// cycle. The `Vec<HeapId>` worklist below plays the role of the
    /// "gray" set in the tri-color scheme: an id is gray while still
    /// queued, black once popped and its children pushed.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = Value>) {
        let mut worklist: Vec<HeapId> = Vec::new();
        for v in roots {
            if let Value::Heap(id) = v {
                self.mark_one(id, &mut worklist);
            }
        }
        while let Some(id) = worklist.pop() {
            let children = self.children_of(id);
            for child in children {
                if let Value::Heap(cid) = child {
                    self.mark_one(cid, &mut worklist);
                }
            }
        }
        self.sweep();
        self.allocations_since_sweep = 0;
    }

    fn mark_one(&mut self, id: HeapId, worklist: &mut Vec<HeapId>) {
        let slot = &mut self.slots[id.index()];
        if slot.data.is_none() || slot.marked {
            return;
        }
        slot.marked = true;
        worklist.push(id);
    }

    fn children_of(&self, id: HeapId) -> SmallVec<[Value; 4]> {
        match self.get(id) {
            ObjData::Array(items) => items.iter().copied().collect(),
            ObjData::Map(m) => m.entries.iter().flat_map(|(k, v)| [*k, *v]).collect(),
            ObjData::Function(f) => f.free_vars.iter().copied().collect(),
            ObjData::String(_) | ObjData::Error(_) | ObjData::External(_) => SmallVec::new(),
        }
    }

    fn sweep(&mut self) {
        for idx in 0..self.slots.len() {
            let slot = &mut self.slots[idx];
            if slot.data.is_none() {
                continue;
            }
            if slot.marked {
                slot.marked = false;
            } else {
                let kind = slot.data.as_ref().unwrap().kind();
                slot.data = None; // drops the payload
                self.free_lists[kind_slot(kind)].push(idx as u32);
            }
        }
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.data.is_some()).count()
    }
}

/// A stable hash over bytes for map-key strings (cached on the string
/// object after first use). Numbers and bools all hash through the same
/// float bit pattern, since `values_equal` treats them as interchangeable
/// (`true == 1`, `1 == 1.0`) and keys that compare equal must land in the
/// same bucket — spec.md §4.6.
pub fn hash_key(heap: &Heap, value: &Value) -> Option<u64> {
    match value {
        Value::Bool(b) => Some(hash_bytes(&(if *b { 1.0_f64 } else { 0.0_f64 }).to_bits().to_le_bytes())),
        Value::Int(i) => Some(hash_bytes(&(*i as f64).to_bits().to_le_bytes())),
        Value::Float(f) => Some(hash_bytes(&f.to_bits().to_le_bytes())),
        Value::Heap(id) => match heap.get(*id) {
            ObjData::String(s) => Some(s.hash()),
            _ => None,
        },
        Value::Null | Value::Native(_) => None,
    }
}
