//! Object headers and type descriptors
//!
//! Every collected object is laid out as `[ObjectHeader][payload]` inside an
//! arena. The header carries the tri-color mark, the payload capacity, the
//! object's [`TypeInfo`] and the intrusive free-list link used after sweep.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use smallvec::SmallVec;

use crate::runtime::memory::{align_up, ARENA_ALIGN};

/// Size of one payload word (pointer-sized field).
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Bytes reserved in front of every payload.
pub const HEADER_SIZE: usize = match align_up(std::mem::size_of::<ObjectHeader>(), ARENA_ALIGN) {
    Some(size) => size,
    None => panic!("object header size overflows"),
};

/// Tri-color mark state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Color {
    /// Not yet reached; reclaimed by sweep.
    White = 0,
    /// Reached, fields not yet scanned.
    Gray = 1,
    /// Reached and fully scanned.
    Black = 2,
}

impl Color {
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            1 => Color::Gray,
            2 => Color::Black,
            _ => Color::White,
        }
    }
}

/// Immutable layout descriptor for a managed type.
///
/// Bit `i` of the pointer map is set when payload word `i` holds a
/// reference to another managed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    name: String,
    size: usize,
    pointer_map: SmallVec<[u64; 2]>,
}

impl TypeInfo {
    /// A type with no pointer fields.
    pub fn new(
        name: impl Into<String>,
        size: usize,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            pointer_map: SmallVec::new(),
        }
    }

    /// A type whose listed word indices are pointer fields.
    ///
    /// Indices beyond `size / WORD_SIZE` are ignored.
    pub fn with_pointers(
        name: impl Into<String>,
        size: usize,
        pointer_words: &[usize],
    ) -> Self {
        let words = size / WORD_SIZE;
        let mut pointer_map: SmallVec<[u64; 2]> = SmallVec::new();
        pointer_map.resize(words.div_ceil(64), 0);
        for &word in pointer_words.iter().filter(|&&w| w < words) {
            pointer_map[word / 64] |= 1 << (word % 64);
        }
        Self {
            name: name.into(),
            size,
            pointer_map,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether payload word `word` is a pointer field.
    #[inline]
    pub fn is_pointer(
        &self,
        word: usize,
    ) -> bool {
        self.pointer_map
            .get(word / 64)
            .is_some_and(|bits| bits & (1 << (word % 64)) != 0)
    }

    /// Iterate over the indices of pointer fields.
    pub fn pointer_words(&self) -> impl Iterator<Item = usize> + '_ {
        self.pointer_map
            .iter()
            .enumerate()
            .flat_map(|(chunk, &bits)| {
                (0..64)
                    .filter(move |bit| bits & (1 << bit) != 0)
                    .map(move |bit| chunk * 64 + bit)
            })
    }

    /// Whether the type has any pointer fields.
    #[inline]
    pub fn has_pointers(&self) -> bool {
        self.pointer_map.iter().any(|&bits| bits != 0)
    }
}

/// Per-object metadata stored directly in front of the payload.
#[repr(C)]
#[derive(Debug)]
pub struct ObjectHeader {
    color: AtomicU8,
    /// Payload capacity in bytes (a multiple of [`ARENA_ALIGN`]).
    size: usize,
    type_info: *const TypeInfo,
    /// Next block on the free list; null while the object is live.
    next_free: *mut ObjectHeader,
}

impl ObjectHeader {
    #[inline]
    pub fn color(&self) -> Color {
        Color::from_u8(self.color.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_color(
        &self,
        color: Color,
    ) {
        self.color.store(color as u8, Ordering::Release);
    }

    /// Atomically move from `from` to `to`; false if the color was different.
    #[inline]
    pub fn transition(
        &self,
        from: Color,
        to: Color,
    ) -> bool {
        self.color
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Total footprint in the heap, header included.
    #[inline]
    pub fn footprint(&self) -> usize {
        HEADER_SIZE + self.size
    }

    /// The object's type descriptor.
    ///
    /// The collector keeps every registered `TypeInfo` alive for its own
    /// lifetime, so the reference is valid for as long as the header is.
    #[inline]
    pub fn type_info(&self) -> &TypeInfo {
        // SAFETY: see above; the pointer was taken from a registered Arc.
        unsafe { &*self.type_info }
    }
}

/// Raw pointer to a header, shareable between mark workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct HeaderPtr(NonNull<ObjectHeader>);

// SAFETY: headers are only mutated through atomics, or under the collector's
// world lock / free-list lock.
unsafe impl Send for HeaderPtr {}
// SAFETY: as above.
unsafe impl Sync for HeaderPtr {}

impl HeaderPtr {
    /// Write a fresh header at `block` and return it.
    ///
    /// # Safety
    /// `block` must be valid for `HEADER_SIZE + size` bytes and aligned to
    /// [`ARENA_ALIGN`].
    pub(crate) unsafe fn init(
        block: NonNull<u8>,
        size: usize,
        type_info: *const TypeInfo,
        color: Color,
    ) -> Self {
        let header = block.cast::<ObjectHeader>();
        ptr::write(
            header.as_ptr(),
            ObjectHeader {
                color: AtomicU8::new(color as u8),
                size,
                type_info,
                next_free: ptr::null_mut(),
            },
        );
        HeaderPtr(header)
    }

    /// Recover the header of a payload pointer.
    ///
    /// # Safety
    /// `payload` must have been produced by [`HeaderPtr::payload`].
    #[inline]
    pub(crate) unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        HeaderPtr(NonNull::new_unchecked(payload.as_ptr().sub(HEADER_SIZE)).cast())
    }

    #[inline]
    pub(crate) fn payload(self) -> NonNull<u8> {
        // SAFETY: every header is followed by its payload in the same block.
        unsafe { NonNull::new_unchecked(self.0.as_ptr().cast::<u8>().add(HEADER_SIZE)) }
    }

    #[inline]
    pub(crate) fn get(&self) -> &ObjectHeader {
        // SAFETY: headers outlive every HeaderPtr the collector hands around.
        unsafe { self.0.as_ref() }
    }

    /// Reinitialize a recycled block for a new object.
    ///
    /// # Safety
    /// Caller must own the block exclusively (popped off the free list).
    pub(crate) unsafe fn recycle(
        self,
        type_info: *const TypeInfo,
        color: Color,
    ) {
        let header = self.0.as_ptr();
        (*header).type_info = type_info;
        (*header).next_free = ptr::null_mut();
        (*header).color.store(color as u8, Ordering::Release);
        ptr::write_bytes(self.payload().as_ptr(), 0, (*header).size);
    }

    /// # Safety
    /// Caller must hold the free-list lock.
    #[inline]
    pub(crate) unsafe fn next_free(self) -> Option<HeaderPtr> {
        NonNull::new((*self.0.as_ptr()).next_free).map(HeaderPtr)
    }

    /// # Safety
    /// Caller must hold the free-list lock.
    #[inline]
    pub(crate) unsafe fn set_next_free(
        self,
        next: Option<HeaderPtr>,
    ) {
        (*self.0.as_ptr()).next_free = next.map_or(ptr::null_mut(), |h| h.0.as_ptr());
    }

    /// Atomic view of payload word `index`.
    ///
    /// # Safety
    /// `index` must be below `size / WORD_SIZE`.
    #[inline]
    pub(crate) unsafe fn word(
        &self,
        index: usize,
    ) -> &AtomicUsize {
        &*(self.payload().as_ptr().cast::<AtomicUsize>().add(index))
    }
}

/// Handle to a collected object's payload.
///
/// A `GcPtr` stays valid until a collection finds the object unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcPtr(NonNull<u8>);

// SAFETY: a GcPtr is an address; all access goes through the collector.
unsafe impl Send for GcPtr {}
// SAFETY: as above.
unsafe impl Sync for GcPtr {}

impl GcPtr {
    #[inline]
    pub(crate) fn from_header(header: HeaderPtr) -> Self {
        GcPtr(header.payload())
    }

    /// Raw payload pointer.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Payload address.
    #[inline]
    pub fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn header(&self) -> HeaderPtr {
        // SAFETY: GcPtrs are only created from headers.
        unsafe { HeaderPtr::from_payload(self.0) }
    }
}
