//! Tagged values, the predefined class ids and the raw accessors every collector uses to
//! read object layouts.

use crate::error::HeapError;
use crate::globals::{OBJECT_ALIGNMENT, WORD_SIZE};
use crate::header::Header;
use crate::page::Page;

pub type ClassId = u16;
/// A pointer-sized slot inside a root set or an object.
pub type Slot = *mut ObjectPtr;

pub const ILLEGAL_CID: ClassId = 0;
pub const FREE_LIST_ELEMENT_CID: ClassId = 1;
pub const FORWARDING_CORPSE_CID: ClassId = 2;
pub const INSTANCE_CID: ClassId = 3;
pub const BYTES_CID: ClassId = 4;
pub const WEAK_PROPERTY_CID: ClassId = 5;
pub const FUNCTION_CID: ClassId = 6;
pub const CODE_CID: ClassId = 7;
pub const STACK_MAP_CID: ClassId = 8;
pub const SUSPEND_STATE_CID: ClassId = 9;
pub const NUM_PREDEFINED_CIDS: ClassId = 10;

/// Word-sized tagged value: heap references carry a low `1` bit, small integers a low `0`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct ObjectPtr(usize);

impl ObjectPtr {
    pub const NULL: Self = ObjectPtr(0);
    pub const HEAP_OBJECT_TAG: usize = 1;

    #[inline(always)]
    pub fn from_addr(addr: usize) -> Self {
        debug_assert!(addr % OBJECT_ALIGNMENT == 0, "misaligned object {:#x}", addr);
        ObjectPtr(addr | Self::HEAP_OBJECT_TAG)
    }
    #[inline(always)]
    pub const fn from_smi(value: isize) -> Self {
        ObjectPtr((value << 1) as usize)
    }
    #[inline(always)]
    pub const fn from_raw(raw: usize) -> Self {
        ObjectPtr(raw)
    }
    #[inline(always)]
    pub const fn raw(self) -> usize {
        self.0
    }
    #[inline(always)]
    pub const fn is_heap_object(self) -> bool {
        self.0 & Self::HEAP_OBJECT_TAG != 0
    }
    #[inline(always)]
    pub const fn is_immediate(self) -> bool {
        !self.is_heap_object()
    }
    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
    #[inline(always)]
    pub fn addr(self) -> usize {
        debug_assert!(self.is_heap_object());
        self.0 & !Self::HEAP_OBJECT_TAG
    }
    #[inline(always)]
    pub fn smi_value(self) -> isize {
        debug_assert!(self.is_immediate());
        (self.0 as isize) >> 1
    }

    #[inline(always)]
    pub unsafe fn header_word(self) -> u64 {
        (self.addr() as *const u64).read()
    }
    #[inline(always)]
    pub unsafe fn set_header_word(self, word: u64) {
        (self.addr() as *mut u64).write(word)
    }
    #[inline(always)]
    pub unsafe fn header(self) -> Header {
        Header::from_raw(self.header_word())
    }
    #[inline(always)]
    pub unsafe fn set_header(self, header: Header) {
        self.set_header_word(header.raw())
    }
    #[inline(always)]
    pub unsafe fn class_id(self) -> ClassId {
        self.header().class_id()
    }

    /// Address of payload word `index` (word 0 follows the header).
    #[inline(always)]
    pub fn field_addr(self, index: usize) -> Slot {
        (self.addr() + WORD_SIZE * (index + 1)) as Slot
    }
    #[inline(always)]
    pub unsafe fn field(self, index: usize) -> ObjectPtr {
        self.field_addr(index).read()
    }
    /// Writes a field without any barrier.
    #[inline(always)]
    pub unsafe fn set_field(self, index: usize, value: ObjectPtr) {
        self.field_addr(index).write(value)
    }
    #[inline(always)]
    pub unsafe fn raw_field(self, index: usize) -> usize {
        (self.field_addr(index) as *const usize).read()
    }
    #[inline(always)]
    pub unsafe fn set_raw_field(self, index: usize, value: usize) {
        (self.field_addr(index) as *mut usize).write(value)
    }

    /// Size in bytes of the object including its header.
    ///
    /// # Safety
    /// The header must be a live header, not a scavenger forward.
    pub unsafe fn heap_size(self) -> usize {
        let header = self.header();
        debug_assert!(!header.forwarded());
        if let Some(size) = header.tagged_size() {
            return size;
        }
        match header.class_id() {
            FREE_LIST_ELEMENT_CID | FORWARDING_CORPSE_CID => self.raw_field(1),
            _ => (*Page::of(self.addr())).large_object_size(),
        }
    }

    /// Number of payload words following the header.
    pub unsafe fn payload_words(self) -> usize {
        self.heap_size() / WORD_SIZE - 1
    }
}

impl std::fmt::Debug for ObjectPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_heap_object() {
            write!(f, "ObjectPtr({:#x})", self.addr())
        } else {
            write!(f, "Smi({})", self.smi_value())
        }
    }
}

/// How the collectors interpret the payload of a class.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ClassKind {
    FreeListElement,
    ForwardingCorpse,
    /// Every payload word is a tagged value.
    Instance,
    /// Word 0 is a raw byte length, the rest is opaque.
    Bytes,
    /// `key`, `value`.
    WeakProperty,
    /// `code`, `name`, `owner`.
    Function,
    /// Opaque instructions, same layout as bytes.
    Code,
    /// Word 0 is the number of frame slots, followed by a bit vector of pointer slots.
    StackMap,
    /// `stack_map`, `frame_length`, then frame words described by the stack map.
    SuspendState,
}

impl ClassKind {
    pub fn has_pointers(self) -> bool {
        !matches!(
            self,
            ClassKind::FreeListElement
                | ClassKind::ForwardingCorpse
                | ClassKind::Bytes
                | ClassKind::Code
                | ClassKind::StackMap
        )
    }
}

pub mod layout {
    pub const WEAK_PROPERTY_KEY: usize = 0;
    pub const WEAK_PROPERTY_VALUE: usize = 1;
    pub const WEAK_PROPERTY_WORDS: usize = 2;

    pub const FUNCTION_CODE: usize = 0;
    pub const FUNCTION_NAME: usize = 1;
    pub const FUNCTION_OWNER: usize = 2;
    pub const FUNCTION_WORDS: usize = 3;

    pub const BYTES_LENGTH: usize = 0;

    pub const STACK_MAP_LENGTH: usize = 0;
    pub const STACK_MAP_BITS: usize = 1;

    pub const SUSPEND_STATE_STACK_MAP: usize = 0;
    pub const SUSPEND_STATE_FRAME_LENGTH: usize = 1;
    pub const SUSPEND_STATE_FRAME: usize = 2;
}

#[derive(Clone, Debug)]
pub struct ClassInfo {
    pub name: String,
    pub kind: ClassKind,
}

/// Registry of class ids the collectors are allowed to encounter.
pub struct ClassTable {
    classes: Vec<Option<ClassInfo>>,
}

impl ClassTable {
    pub fn new() -> Self {
        let mut classes = vec![None; NUM_PREDEFINED_CIDS as usize];
        let predefined = [
            (FREE_LIST_ELEMENT_CID, "FreeListElement", ClassKind::FreeListElement),
            (FORWARDING_CORPSE_CID, "ForwardingCorpse", ClassKind::ForwardingCorpse),
            (INSTANCE_CID, "Instance", ClassKind::Instance),
            (BYTES_CID, "Bytes", ClassKind::Bytes),
            (WEAK_PROPERTY_CID, "WeakProperty", ClassKind::WeakProperty),
            (FUNCTION_CID, "Function", ClassKind::Function),
            (CODE_CID, "Code", ClassKind::Code),
            (STACK_MAP_CID, "StackMap", ClassKind::StackMap),
            (SUSPEND_STATE_CID, "SuspendState", ClassKind::SuspendState),
        ];
        for (cid, name, kind) in predefined.iter() {
            classes[*cid as usize] = Some(ClassInfo {
                name: name.to_string(),
                kind: *kind,
            });
        }
        Self { classes }
    }

    /// Registers an embedder class. Only instance-like and byte-like layouts can be added.
    pub fn register(&mut self, name: &str, kind: ClassKind) -> Result<ClassId, HeapError> {
        if !matches!(kind, ClassKind::Instance | ClassKind::Bytes) {
            return Err(HeapError::UnsupportedClassKind(kind));
        }
        let cid = self.classes.len();
        if cid > u16::MAX as usize {
            return Err(HeapError::ClassTableFull);
        }
        self.classes.push(Some(ClassInfo {
            name: name.to_string(),
            kind,
        }));
        Ok(cid as ClassId)
    }

    #[inline]
    pub fn kind(&self, cid: ClassId) -> Option<ClassKind> {
        match self.classes.get(cid as usize) {
            Some(Some(info)) => Some(info.kind),
            _ => None,
        }
    }

    pub fn info(&self, cid: ClassId) -> Option<&ClassInfo> {
        self.classes.get(cid as usize).and_then(|c| c.as_ref())
    }

    pub fn is_registered(&self, cid: ClassId) -> bool {
        self.kind(cid).is_some()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Kind of `obj`, aborting on an unregistered class id.
pub unsafe fn kind_of(classes: &ClassTable, obj: ObjectPtr) -> ClassKind {
    let cid = obj.class_id();
    match classes.kind(cid) {
        Some(kind) => kind,
        None => crate::fatal!(
            "object {:?} has unregistered class id {} ({:?})",
            obj,
            cid,
            obj.header()
        ),
    }
}

/// Calls `f` for every tagged slot of a stack-mapped frame.
///
/// # Safety
/// `stack_map` must be a valid, non-forwarded stack map and `frame` must hold
/// `frame_length` words.
pub unsafe fn visit_frame_slots(
    stack_map: ObjectPtr,
    frame: Slot,
    frame_length: usize,
    f: &mut dyn FnMut(Slot),
) {
    for i in 0..frame_length {
        if is_pointer_slot(stack_map, i) {
            f(frame.add(i));
        }
    }
}

/// Whether word `index` of a frame described by `stack_map` holds a tagged value.
pub unsafe fn is_pointer_slot(stack_map: ObjectPtr, index: usize) -> bool {
    if index >= stack_map.raw_field(layout::STACK_MAP_LENGTH) {
        return false;
    }
    let word = stack_map.raw_field(layout::STACK_MAP_BITS + index / 64);
    word & (1 << (index % 64)) != 0
}

/// Visits the frame words of a suspend state using its (already current) stack map.
pub unsafe fn visit_suspend_state_frame(obj: ObjectPtr, f: &mut dyn FnMut(Slot)) {
    let stack_map = obj.field(layout::SUSPEND_STATE_STACK_MAP);
    if !stack_map.is_heap_object() {
        return;
    }
    let length = obj.field(layout::SUSPEND_STATE_FRAME_LENGTH).smi_value() as usize;
    visit_frame_slots(
        stack_map,
        obj.field_addr(layout::SUSPEND_STATE_FRAME),
        length,
        f,
    );
}

/// Calls `f` for every tagged slot of `obj` according to its class kind.
///
/// Suspend states visit their stack-map slot first and then read the frame layout through
/// whatever that slot holds afterwards, so a visitor that moves the stack map sees the
/// frame through the moved copy.
pub unsafe fn visit_pointers(classes: &ClassTable, obj: ObjectPtr, f: &mut dyn FnMut(Slot)) {
    let kind = kind_of(classes, obj);
    match kind {
        ClassKind::FreeListElement
        | ClassKind::ForwardingCorpse
        | ClassKind::Bytes
        | ClassKind::Code
        | ClassKind::StackMap => {}
        ClassKind::Instance | ClassKind::WeakProperty | ClassKind::Function => {
            let words = obj.payload_words();
            for i in 0..words {
                f(obj.field_addr(i));
            }
        }
        ClassKind::SuspendState => {
            f(obj.field_addr(layout::SUSPEND_STATE_STACK_MAP));
            visit_suspend_state_frame(obj, f);
        }
    }
}
