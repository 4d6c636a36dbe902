// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed-object class registry.
//!
//! A *class* is a named pool of fixed-size payload blocks with optional
//! *extensions*: extra byte ranges appended to every block, plus observer
//! hooks receiving add/change/remove events for the class's objects.
//!
//! Freed blocks are retained on a per-class free list and recycled on the
//! next allocation, keeping the hot path O(1). With `class.debug` enabled
//! every live block is sandwiched between a prefix guard (class id plus a
//! magic word) and a suffix guard (second magic word); `free` validates the
//! guards and recycling is disabled so stale pointers surface immediately.
//! A guard mismatch is heap corruption and panics.
//!
//! Extension byte ranges may only be added while a class has never
//! allocated; after the first allocation the block size is frozen.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// First guard magic word, stored after the class id in the prefix.
pub const CLASS_GUARD1: u32 = 0x1357_2468;
/// Second guard magic word, stored in the suffix.
pub const CLASS_GUARD2: u32 = 0x7531_8642;

const GUARD_PREFIX_LEN: usize = 8;
const GUARD_SUFFIX_LEN: usize = 4;

/// Events fired for class objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassEvent {
    /// A new object has been added.
    Added,
    /// An object has changed.
    Changed,
    /// An object is about to be removed.
    Removed,
}

impl ClassEvent {
    pub fn name(self) -> &'static str {
        match self {
            ClassEvent::Added => "added",
            ClassEvent::Changed => "changed",
            ClassEvent::Removed => "removed",
        }
    }
}

/// Observer hooks attached to a class extension.
///
/// The subject is the typed event object of the owning subsystem, passed
/// opaquely; observers downcast to the type they expect. Observers may
/// mutate shared state but must not allocate or free the subject object.
pub trait ClassObserver {
    fn on_added(&self, _subject: &dyn Any) {}
    fn on_changed(&self, _subject: &dyn Any) {}
    fn on_removed(&self, _subject: &dyn Any) {}
}

/// Registration parameters for a class.
pub struct ClassSpec {
    /// Unique class name (case-insensitive key).
    pub name: &'static str,
    /// Payload size in bytes, rounded up to a word multiple internally.
    pub size: usize,
    /// Minimum number of freed blocks kept for recycling.
    pub min_free_count: u32,
    /// Optional object-to-string hook for debug logging.
    pub to_keystring: Option<fn(&ClassBlock) -> String>,
}

impl ClassSpec {
    pub fn new(name: &'static str, size: usize) -> Self {
        Self {
            name,
            size,
            min_free_count: 0,
            to_keystring: None,
        }
    }
}

/// Registration parameters for a class extension.
pub struct ExtensionSpec {
    /// Name of the consumer, for diagnostics.
    pub ext_name: &'static str,
    /// Name of the class being extended.
    pub class_name: &'static str,
    /// Extra bytes appended to every block; zero for observer-only hooks.
    pub size: usize,
    /// Optional event observer.
    pub observer: Option<Rc<dyn ClassObserver>>,
}

/// Handle to a registered extension.
///
/// Carries the byte range assigned at registration; `slice`/`slice_mut`
/// view that range inside a block of the extended class.
#[derive(Debug, Clone)]
pub struct Extension {
    id: u64,
    class_key: String,
    offset: usize,
    size: usize,
}

impl Extension {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// View the extension bytes of a block.
    pub fn slice<'a>(&self, block: &'a ClassBlock) -> &'a [u8] {
        &block.payload()[self.offset..self.offset + self.size]
    }

    /// Mutable view of the extension bytes of a block.
    pub fn slice_mut<'a>(&self, block: &'a mut ClassBlock) -> &'a mut [u8] {
        &mut block.payload_mut()[self.offset..self.offset + self.size]
    }
}

/// Owned payload block allocated from a class.
pub struct ClassBlock {
    class_id: u32,
    debug: bool,
    total_size: usize,
    buf: Box<[u8]>,
}

impl std::fmt::Debug for ClassBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassBlock")
            .field("class_id", &self.class_id)
            .field("total_size", &self.total_size)
            .field("debug", &self.debug)
            .finish()
    }
}

impl ClassBlock {
    /// Payload bytes (extensions included), excluding debug guards.
    pub fn payload(&self) -> &[u8] {
        if self.debug {
            &self.buf[GUARD_PREFIX_LEN..GUARD_PREFIX_LEN + self.total_size]
        } else {
            &self.buf
        }
    }

    /// Mutable payload bytes, excluding debug guards.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        if self.debug {
            &mut self.buf[GUARD_PREFIX_LEN..GUARD_PREFIX_LEN + self.total_size]
        } else {
            &mut self.buf
        }
    }

    fn write_guards(&mut self) {
        let id = self.class_id;
        let total = self.total_size;
        self.buf[0..4].copy_from_slice(&id.to_ne_bytes());
        self.buf[4..8].copy_from_slice(&CLASS_GUARD1.to_ne_bytes());
        let suffix = GUARD_PREFIX_LEN + total;
        self.buf[suffix..suffix + 4].copy_from_slice(&CLASS_GUARD2.to_ne_bytes());
    }

    fn guards_valid(&self) -> bool {
        if !self.debug {
            return true;
        }
        let id = u32::from_ne_bytes(self.buf[0..4].try_into().unwrap());
        let guard1 = u32::from_ne_bytes(self.buf[4..8].try_into().unwrap());
        let suffix = GUARD_PREFIX_LEN + self.total_size;
        let guard2 = u32::from_ne_bytes(self.buf[suffix..suffix + 4].try_into().unwrap());
        id == self.class_id && guard1 == CLASS_GUARD1 && guard2 == CLASS_GUARD2
    }
}

/// Errors raised by registry operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassError {
    /// A class with the same (case-insensitive) name already exists.
    DuplicateClass(String),
    /// No class with the given name is registered.
    UnknownClass(String),
    /// A non-zero-size extension was registered after the first allocation.
    ClassFrozen(String),
    /// Extension list mutated while an event fan-out is running.
    FanoutInProgress(String),
}

impl std::fmt::Display for ClassError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateClass(name) => write!(f, "class '{}' already registered", name),
            Self::UnknownClass(name) => write!(f, "unknown class '{}'", name),
            Self::ClassFrozen(name) => {
                write!(f, "class '{}' is already in use and cannot be extended", name)
            }
            Self::FanoutInProgress(name) => {
                write!(f, "class '{}' extension list is locked during event fan-out", name)
            }
        }
    }
}

impl std::error::Error for ClassError {}

struct ExtensionRec {
    id: u64,
    ext_name: &'static str,
    size: usize,
    offset: usize,
    observer: Option<Rc<dyn ClassObserver>>,
}

struct Class {
    name: &'static str,
    total_size: usize,
    min_free_count: u32,
    debug: bool,
    id: u32,
    to_keystring: Option<fn(&ClassBlock) -> String>,
    free_list: Vec<Box<[u8]>>,
    in_use: u32,
    allocated: u32,
    recycled: u32,
    extensions: Vec<ExtensionRec>,
    firing: u32,
}

impl Class {
    fn block_size(&self) -> usize {
        if self.debug {
            self.total_size + GUARD_PREFIX_LEN + GUARD_SUFFIX_LEN
        } else {
            self.total_size
        }
    }
}

/// Usage statistics of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassStats {
    /// Blocks currently live.
    pub in_use: u32,
    /// Blocks waiting on the free list.
    pub free_listed: u32,
    /// Lifetime fresh allocations.
    pub allocated: u32,
    /// Lifetime recycled allocations.
    pub recycled: u32,
}

/// Registry of object classes keyed by case-insensitive name.
pub struct ClassRegistry {
    classes: BTreeMap<String, Class>,
    next_class_id: u32,
    next_ext_id: u64,
    debug_default: bool,
}

fn roundup(size: usize) -> usize {
    let word = std::mem::size_of::<usize>();
    (size + word - 1) & !(word - 1)
}

fn key_of(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl ClassRegistry {
    pub fn new(debug_default: bool) -> Self {
        Self {
            classes: BTreeMap::new(),
            next_class_id: 1,
            next_ext_id: 1,
            debug_default,
        }
    }

    /// Register a new class.
    pub fn register(&mut self, spec: ClassSpec) -> Result<(), ClassError> {
        let key = key_of(spec.name);
        if self.classes.contains_key(&key) {
            return Err(ClassError::DuplicateClass(spec.name.to_string()));
        }
        let id = self.next_class_id;
        self.next_class_id += 1;
        let total_size = roundup(spec.size);
        log::debug!(
            "[CLASS] class {} (id={}) added: {} bytes",
            spec.name,
            id,
            total_size
        );
        self.classes.insert(
            key,
            Class {
                name: spec.name,
                total_size,
                min_free_count: spec.min_free_count,
                debug: self.debug_default,
                id,
                to_keystring: spec.to_keystring,
                free_list: Vec::new(),
                in_use: 0,
                allocated: 0,
                recycled: 0,
                extensions: Vec::new(),
                firing: 0,
            },
        );
        Ok(())
    }

    /// Remove a class, releasing its free list and detaching extensions.
    pub fn unregister(&mut self, name: &str) -> Result<(), ClassError> {
        let key = key_of(name);
        match self.classes.remove(&key) {
            Some(class) => {
                log::debug!("[CLASS] class {} removed", class.name);
                Ok(())
            }
            None => Err(ClassError::UnknownClass(name.to_string())),
        }
    }

    /// Allocate a zeroed block, recycling from the free list when possible.
    pub fn alloc(&mut self, name: &str) -> Result<ClassBlock, ClassError> {
        let key = key_of(name);
        let class = self
            .classes
            .get_mut(&key)
            .ok_or_else(|| ClassError::UnknownClass(name.to_string()))?;

        let mut block = match class.free_list.pop() {
            Some(mut buf) => {
                buf.fill(0);
                class.recycled += 1;
                ClassBlock {
                    class_id: class.id,
                    debug: class.debug,
                    total_size: class.total_size,
                    buf,
                }
            }
            None => {
                class.allocated += 1;
                ClassBlock {
                    class_id: class.id,
                    debug: class.debug,
                    total_size: class.total_size,
                    buf: vec![0u8; class.block_size()].into_boxed_slice(),
                }
            }
        };
        class.in_use += 1;
        if class.debug {
            block.write_guards();
        }
        log::trace!("[CLASS] alloc {}, {} bytes", class.name, class.total_size);
        Ok(block)
    }

    /// Return a block to its class.
    ///
    /// With debug off the block is retained for recycling while the free
    /// list is shorter than `max(min_free_count, in_use / 10)`; with debug
    /// on the guards are validated and the memory always released.
    ///
    /// # Panics
    ///
    /// Panics when the block does not belong to the class or its guards
    /// were overwritten (heap corruption is fatal).
    pub fn free(&mut self, name: &str, block: ClassBlock) -> Result<(), ClassError> {
        let key = key_of(name);
        let class = self
            .classes
            .get_mut(&key)
            .ok_or_else(|| ClassError::UnknownClass(name.to_string()))?;

        assert_eq!(
            block.class_id, class.id,
            "class '{}' (id={}): freed block belongs to class id {}",
            class.name, class.id, block.class_id
        );
        if class.debug {
            assert!(
                block.guards_valid(),
                "class '{}' (id={}): guard is bad",
                class.name,
                class.id
            );
        }

        let free_len = class.free_list.len() as u32;
        let keep = !class.debug
            && (free_len < class.min_free_count || free_len < class.in_use / 10);
        if keep {
            class.free_list.push(block.buf);
        }
        class.in_use -= 1;
        log::trace!(
            "[CLASS] free {}, {} bytes{}",
            class.name,
            class.total_size,
            if keep { ", reuse" } else { "" }
        );
        Ok(())
    }

    /// Validate a block's guards without freeing it. No-op with debug off.
    pub fn check(&self, name: &str, block: &ClassBlock) {
        let Some(class) = self.classes.get(&key_of(name)) else {
            return;
        };
        if class.debug {
            assert!(
                block.guards_valid(),
                "class '{}' (id={}): guard is bad",
                class.name,
                class.id
            );
        }
    }

    /// Register an extension on an existing class.
    ///
    /// Fails when the extension declares extra bytes and the class has
    /// already allocated; zero-size (observer-only) extensions always
    /// succeed. Registering a sized extension empties the free list since
    /// retained blocks would be undersized.
    pub fn extension_register(&mut self, spec: ExtensionSpec) -> Result<Extension, ClassError> {
        let key = key_of(spec.class_name);
        let class = self
            .classes
            .get_mut(&key)
            .ok_or_else(|| ClassError::UnknownClass(spec.class_name.to_string()))?;

        if class.firing > 0 {
            return Err(ClassError::FanoutInProgress(class.name.to_string()));
        }
        if spec.size > 0 && class.allocated != 0 {
            log::warn!(
                "[CLASS] class {} is already in use and cannot be extended by '{}'",
                class.name,
                spec.ext_name
            );
            return Err(ClassError::ClassFrozen(class.name.to_string()));
        }

        let id = self.next_ext_id;
        self.next_ext_id += 1;

        let mut offset = 0;
        if spec.size > 0 {
            class.free_list.clear();
            offset = class.total_size;
            class.total_size = roundup(class.total_size + spec.size);
            log::debug!(
                "[CLASS] class {} extended: {} bytes, '{}' has offset {} and length {}",
                class.name,
                class.total_size,
                spec.ext_name,
                offset,
                spec.size
            );
        }

        class.extensions.push(ExtensionRec {
            id,
            ext_name: spec.ext_name,
            size: spec.size,
            offset,
            observer: spec.observer,
        });

        Ok(Extension {
            id,
            class_key: key,
            offset,
            size: spec.size,
        })
    }

    /// Detach an extension from its class.
    pub fn extension_unregister(&mut self, ext: &Extension) -> Result<(), ClassError> {
        let class = self
            .classes
            .get_mut(&ext.class_key)
            .ok_or_else(|| ClassError::UnknownClass(ext.class_key.clone()))?;
        if class.firing > 0 {
            return Err(ClassError::FanoutInProgress(class.name.to_string()));
        }
        class.extensions.retain(|rec| rec.id != ext.id);
        Ok(())
    }

    /// Usage statistics of a class.
    pub fn stats(&self, name: &str) -> Option<ClassStats> {
        self.classes.get(&key_of(name)).map(|c| ClassStats {
            in_use: c.in_use,
            free_listed: c.free_list.len() as u32,
            allocated: c.allocated,
            recycled: c.recycled,
        })
    }

    /// Total block payload size of a class, extensions included.
    pub fn total_size(&self, name: &str) -> Option<usize> {
        self.classes.get(&key_of(name)).map(|c| c.total_size)
    }

    /// Registered class names, ordered by key.
    pub fn class_names(&self) -> Vec<&'static str> {
        self.classes.values().map(|c| c.name).collect()
    }

    /// Human-readable key of a block, for diagnostics.
    pub fn keystring(&self, name: &str, block: &ClassBlock) -> String {
        match self.classes.get(&key_of(name)) {
            Some(class) => match class.to_keystring {
                Some(hook) => hook(block),
                None => format!("{}::{:#x}", class.name, block.buf.as_ptr() as usize),
            },
            None => format!("?::{:#x}", block.buf.as_ptr() as usize),
        }
    }

    /// Re-apply the debug flag from configuration.
    ///
    /// Only classes that have never allocated switch modes; their free
    /// lists are emptied because retained blocks lack (or carry) guards.
    pub fn apply_debug(&mut self, debug: bool) {
        self.debug_default = debug;
        for class in self.classes.values_mut() {
            if class.debug != debug && class.allocated == 0 {
                class.debug = debug;
                class.free_list.clear();
            }
        }
    }

    fn collect_observers(
        &mut self,
        key: &str,
    ) -> Option<Vec<(&'static str, Rc<dyn ClassObserver>)>> {
        let class = self.classes.get_mut(key)?;
        class.firing += 1;
        Some(
            class
                .extensions
                .iter()
                .filter_map(|rec| rec.observer.clone().map(|o| (rec.ext_name, o)))
                .collect(),
        )
    }

    fn fanout_done(&mut self, key: &str) {
        if let Some(class) = self.classes.get_mut(key) {
            class.firing -= 1;
        }
    }
}

/// Fire a class event, invoking every extension observer in registration
/// order. The extension list is locked for the duration of the fan-out.
pub fn fire_event(
    registry: &Rc<RefCell<ClassRegistry>>,
    class_name: &str,
    subject: &dyn Any,
    event: ClassEvent,
) {
    let key = key_of(class_name);
    let Some(observers) = registry.borrow_mut().collect_observers(&key) else {
        return;
    };
    log::trace!("[CLASS] fire '{}' event for {}", event.name(), class_name);
    for (ext_name, observer) in observers {
        log::trace!("[CLASS] fire listener {}", ext_name);
        match event {
            ClassEvent::Added => observer.on_added(subject),
            ClassEvent::Changed => observer.on_changed(subject),
            ClassEvent::Removed => observer.on_removed(subject),
        }
    }
    registry.borrow_mut().fanout_done(&key);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    fn registry(debug: bool) -> Rc<RefCell<ClassRegistry>> {
        Rc::new(RefCell::new(ClassRegistry::new(debug)))
    }

    #[test]
    fn test_register_rounds_size_up() {
        let reg = registry(false);
        reg.borrow_mut()
            .register(ClassSpec::new("neigh", 13))
            .unwrap();
        let word = std::mem::size_of::<usize>();
        assert_eq!(reg.borrow().total_size("neigh"), Some((13 / word + 1) * word));
    }

    #[test]
    fn test_duplicate_name_case_insensitive() {
        let reg = registry(false);
        reg.borrow_mut().register(ClassSpec::new("Neigh", 8)).unwrap();
        let err = reg.borrow_mut().register(ClassSpec::new("neigh", 8));
        assert_eq!(err, Err(ClassError::DuplicateClass("neigh".to_string())));
    }

    #[test]
    fn test_alloc_is_zeroed_and_recycled() {
        let reg = registry(false);
        reg.borrow_mut()
            .register(ClassSpec {
                name: "obj",
                size: 16,
                min_free_count: 4,
                to_keystring: None,
            })
            .unwrap();

        let mut block = reg.borrow_mut().alloc("obj").unwrap();
        block.payload_mut().fill(0xAA);
        reg.borrow_mut().free("obj", block).unwrap();

        let block = reg.borrow_mut().alloc("obj").unwrap();
        assert!(block.payload().iter().all(|&b| b == 0));

        let stats = reg.borrow().stats("obj").unwrap();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.recycled, 1);
        assert_eq!(stats.in_use, 1);
    }

    #[test]
    fn test_free_list_retention_heuristic() {
        let reg = registry(false);
        reg.borrow_mut()
            .register(ClassSpec {
                name: "pool",
                size: 8,
                min_free_count: 2,
                to_keystring: None,
            })
            .unwrap();

        let blocks: Vec<_> = (0..4)
            .map(|_| reg.borrow_mut().alloc("pool").unwrap())
            .collect();
        for block in blocks {
            reg.borrow_mut().free("pool", block).unwrap();
        }
        // min_free_count=2 and in_use/10 rounds to zero, so exactly two kept
        assert_eq!(reg.borrow().stats("pool").unwrap().free_listed, 2);
    }

    #[test]
    fn test_debug_guards_validate_and_never_recycle() {
        let reg = registry(true);
        reg.borrow_mut().register(ClassSpec::new("dbg", 24)).unwrap();

        let block = reg.borrow_mut().alloc("dbg").unwrap();
        reg.borrow().check("dbg", &block);
        reg.borrow_mut().free("dbg", block).unwrap();

        let stats = reg.borrow().stats("dbg").unwrap();
        assert_eq!(stats.free_listed, 0);

        let block = reg.borrow_mut().alloc("dbg").unwrap();
        assert_eq!(stats.recycled, 0);
        reg.borrow_mut().free("dbg", block).unwrap();
    }

    #[test]
    #[should_panic(expected = "guard is bad")]
    fn test_guard_overwrite_panics() {
        let reg = registry(true);
        reg.borrow_mut().register(ClassSpec::new("smash", 8)).unwrap();
        let mut block = reg.borrow_mut().alloc("smash").unwrap();
        // overwrite past the payload into the suffix guard
        block.buf[GUARD_PREFIX_LEN + block.total_size] ^= 0xFF;
        reg.borrow_mut().free("smash", block).unwrap();
    }

    #[test]
    fn test_extension_offsets_stack_up() {
        let reg = registry(false);
        reg.borrow_mut().register(ClassSpec::new("base", 10)).unwrap();
        let word = std::mem::size_of::<usize>();
        let base_size = roundup(10);

        let ext1 = reg
            .borrow_mut()
            .extension_register(ExtensionSpec {
                ext_name: "first",
                class_name: "base",
                size: 5,
                observer: None,
            })
            .unwrap();
        let ext2 = reg
            .borrow_mut()
            .extension_register(ExtensionSpec {
                ext_name: "second",
                class_name: "base",
                size: 3,
                observer: None,
            })
            .unwrap();

        assert_eq!(ext1.offset(), base_size);
        assert_eq!(ext2.offset(), roundup(base_size + 5));
        assert_eq!(ext2.offset() % word, 0);

        let mut block = reg.borrow_mut().alloc("base").unwrap();
        ext1.slice_mut(&mut block).fill(1);
        ext2.slice_mut(&mut block).fill(2);
        assert_eq!(ext1.slice(&block), &[1, 1, 1, 1, 1]);
        assert_eq!(ext2.slice(&block), &[2, 2, 2]);
    }

    #[test]
    fn test_sized_extension_refused_after_alloc() {
        let reg = registry(false);
        reg.borrow_mut().register(ClassSpec::new("live", 8)).unwrap();
        let block = reg.borrow_mut().alloc("live").unwrap();

        let err = reg.borrow_mut().extension_register(ExtensionSpec {
            ext_name: "late",
            class_name: "live",
            size: 4,
            observer: None,
        });
        assert_eq!(err.unwrap_err(), ClassError::ClassFrozen("live".to_string()));

        // zero-size (observer-only) extensions still accept
        reg.borrow_mut()
            .extension_register(ExtensionSpec {
                ext_name: "watcher",
                class_name: "live",
                size: 0,
                observer: None,
            })
            .unwrap();

        reg.borrow_mut().free("live", block).unwrap();
    }

    struct RecordingObserver {
        tag: &'static str,
        log: Rc<StdRefCell<Vec<String>>>,
    }

    impl ClassObserver for RecordingObserver {
        fn on_added(&self, _subject: &dyn Any) {
            self.log.borrow_mut().push(format!("{}+add", self.tag));
        }
        fn on_changed(&self, _subject: &dyn Any) {
            self.log.borrow_mut().push(format!("{}+change", self.tag));
        }
        fn on_removed(&self, _subject: &dyn Any) {
            self.log.borrow_mut().push(format!("{}+remove", self.tag));
        }
    }

    #[test]
    fn test_event_fanout_in_registration_order() {
        let reg = registry(false);
        reg.borrow_mut().register(ClassSpec::new("evt", 8)).unwrap();
        let log = Rc::new(StdRefCell::new(Vec::new()));

        for tag in ["a", "b"] {
            reg.borrow_mut()
                .extension_register(ExtensionSpec {
                    ext_name: tag,
                    class_name: "evt",
                    size: 0,
                    observer: Some(Rc::new(RecordingObserver {
                        tag,
                        log: log.clone(),
                    })),
                })
                .unwrap();
        }

        let subject = 7u32;
        fire_event(&reg, "evt", &subject, ClassEvent::Added);
        fire_event(&reg, "evt", &subject, ClassEvent::Removed);

        assert_eq!(
            *log.borrow(),
            vec!["a+add", "b+add", "a+remove", "b+remove"]
        );
    }

    #[test]
    fn test_subject_downcast() {
        let reg = registry(false);
        reg.borrow_mut().register(ClassSpec::new("typed", 8)).unwrap();

        struct Subject {
            seen: StdRefCell<Option<u16>>,
        }
        struct Downcaster;
        impl ClassObserver for Downcaster {
            fn on_added(&self, subject: &dyn Any) {
                let s = subject.downcast_ref::<Subject>().unwrap();
                *s.seen.borrow_mut() = Some(80);
            }
        }

        reg.borrow_mut()
            .extension_register(ExtensionSpec {
                ext_name: "cast",
                class_name: "typed",
                size: 0,
                observer: Some(Rc::new(Downcaster)),
            })
            .unwrap();

        let subject = Subject {
            seen: StdRefCell::new(None),
        };
        fire_event(&reg, "typed", &subject, ClassEvent::Added);
        assert_eq!(*subject.seen.borrow(), Some(80));
    }

    #[test]
    fn test_unregister_releases_everything() {
        let reg = registry(false);
        reg.borrow_mut().register(ClassSpec::new("tmp", 8)).unwrap();
        let block = reg.borrow_mut().alloc("tmp").unwrap();
        reg.borrow_mut().free("tmp", block).unwrap();
        reg.borrow_mut().unregister("tmp").unwrap();
        assert!(reg.borrow().stats("tmp").is_none());
        assert_eq!(
            reg.borrow_mut().alloc("tmp").unwrap_err(),
            ClassError::UnknownClass("tmp".to_string())
        );
    }

    #[test]
    fn test_keystring_hooks() {
        let reg = registry(false);
        reg.borrow_mut().register(ClassSpec::new("plain", 8)).unwrap();
        reg.borrow_mut()
            .register(ClassSpec {
                name: "named",
                size: 8,
                min_free_count: 0,
                to_keystring: Some(|_| "named::custom".to_string()),
            })
            .unwrap();

        let plain = reg.borrow_mut().alloc("plain").unwrap();
        let named = reg.borrow_mut().alloc("named").unwrap();
        assert!(reg.borrow().keystring("plain", &plain).starts_with("plain::0x"));
        assert_eq!(reg.borrow().keystring("named", &named), "named::custom");
        reg.borrow_mut().free("plain", plain).unwrap();
        reg.borrow_mut().free("named", named).unwrap();
    }

    #[test]
    fn test_class_ids_are_unique() {
        let reg = registry(true);
        reg.borrow_mut().register(ClassSpec::new("one", 8)).unwrap();
        reg.borrow_mut().register(ClassSpec::new("two", 8)).unwrap();
        let a = reg.borrow_mut().alloc("one").unwrap();
        let b = reg.borrow_mut().alloc("two").unwrap();
        assert_ne!(a.class_id, b.class_id);
        reg.borrow_mut().free("one", a).unwrap();
        reg.borrow_mut().free("two", b).unwrap();
    }
}
