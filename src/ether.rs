//! The ether: a fixed-capacity ring buffer carrying typed messages with
//! lock-free publication and total-order delivery.
//!
//! An ether is a header plus a power-of-two array of cache-line-aligned
//! slots living in one contiguous region, either private to the process or
//! a file-backed shared mapping that several processes attach to.
//!
//! # Publication protocol
//!
//! Producers claim the next sequence number with a CAS on the header
//! counter, so any number of producer handles publish concurrently and the
//! claimed numbers form a contiguous total order. The claimed slot is
//! prepared by clearing `commitno` and storing the new `seqno` (release),
//! then the payload is constructed in place. `commit` records the message
//! selector and publishes by storing `commitno = seqno` (release).
//!
//! # Delivery protocol
//!
//! A [`Cursor`] delivers slot `s` only once it observes both `seqno == s`
//! and `commitno == s` with acquire loads. A reader that falls more than
//! one lap behind the producers has lost data irrecoverably and observes
//! [`Read::Lapped`]; the hosting dispatcher treats that as fatal.
//!
//! There is no backpressure: producers never wait for readers. It is the
//! reader's responsibility to keep up.

use crate::message::{Member, MemberVisitor, Message, MessageSet};
use crate::mmap::Region;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Alignment unit for the header, each slot, and the payload area.
pub const CACHE_LINE: usize = 64;

/// Offset of the payload area within a slot.
const DATA_OFFSET: usize = CACHE_LINE;

/// Ether attach failures. All of these are structural: the region cannot be
/// used and the hosting assembly must not start.
#[derive(Debug, Error)]
pub enum EtherError {
    #[error("backing region holds {actual} bytes but {required} are required")]
    RegionTooSmall { required: usize, actual: usize },

    #[error("signature mismatch: region holds {found:#018x}, message set is {expected:#018x}")]
    SignatureMismatch { expected: u64, found: u64 },

    #[error("capacity mismatch: region holds {found}, this ether is built for {expected}")]
    CapacityMismatch { expected: u64, found: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Outcome of a single [`Cursor::read`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Read {
    /// One message was delivered to the handler.
    Delivered,
    /// Nothing ready: either no newer publication, or the next slot is
    /// still being written.
    Empty,
    /// The reader fell at least one full lap behind and its next slot has
    /// been overwritten. Unrecoverable for this cursor.
    Lapped,
}

#[repr(C, align(64))]
struct EtherHeader {
    /// Last published sequence number; the next publication claims
    /// `seqno + 1`. Starts at 0.
    seqno: AtomicU64,
    signature: u64,
    capacity: u64,
}

const _: () = assert!(std::mem::size_of::<EtherHeader>() == CACHE_LINE);

#[repr(C)]
struct SlotControl {
    /// Ordinal of the message type occupying the payload area.
    selector: u16,
    _pad: [u8; 6],
    /// Sequence number of the current occupant.
    seqno: AtomicU64,
    /// Equal to `seqno` only once the payload is fully written.
    commitno: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<SlotControl>() <= DATA_OFFSET);

const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// A fixed-capacity ring of typed message slots.
///
/// `L` is the ether's message set; it fixes the slot payload size, the
/// selector ordinals, and the signature validated on attach.
///
/// The ether owns its backing region. Producer operations take `&self` and
/// may be called from any number of threads; each consumer holds its own
/// [`Cursor`].
#[derive(Debug)]
pub struct Ether<L: MessageSet> {
    hdr: NonNull<EtherHeader>,
    slots: NonNull<u8>,
    capacity: u64,
    mask: u64,
    slot_size: usize,
    _region: Region,
    _marker: PhantomData<L>,
}

unsafe impl<L: MessageSet> Send for Ether<L> {}
unsafe impl<L: MessageSet> Sync for Ether<L> {}

impl<L: MessageSet> Ether<L> {
    /// Size of one slot: a control cache line plus the payload area padded
    /// to cache-line alignment.
    pub const SLOT_SIZE: usize = DATA_OFFSET + align_up(L::MAX_SIZE, CACHE_LINE);

    /// Rounds a requested capacity to the effective one: the next power of
    /// two, at least 2.
    pub fn effective_capacity(capacity: usize) -> usize {
        capacity.max(2).next_power_of_two()
    }

    /// Bytes a backing region must provide for the given requested
    /// capacity.
    pub fn required_mem_size(capacity: usize) -> usize {
        std::mem::size_of::<EtherHeader>() + Self::effective_capacity(capacity) * Self::SLOT_SIZE
    }

    /// Creates a process-private ether over a zeroed heap region.
    pub fn private(capacity: usize) -> Result<Arc<Self>, EtherError> {
        let region = Region::anonymous(Self::required_mem_size(capacity))?;
        Self::attach(region, capacity, true)
    }

    /// Creates or joins a shared ether backed by the given file.
    ///
    /// Exactly one process must attach with `reset = true`; every other
    /// attacher passes `reset = false` and must present the same message
    /// set and capacity or the attach fails.
    pub fn shared(path: &str, capacity: usize, reset: bool) -> Result<Arc<Self>, EtherError> {
        let region = Region::map_file(path, Self::required_mem_size(capacity), reset)?;
        Self::attach(region, capacity, reset)
    }

    /// Attaches to an owned backing region.
    ///
    /// With `reset`, the region is zeroed and stamped with this set's
    /// signature and the effective capacity, and the publication counter
    /// starts at 0. Without `reset`, the stamped signature and capacity
    /// must match exactly.
    pub fn attach(region: Region, capacity: usize, reset: bool) -> Result<Arc<Self>, EtherError> {
        let capacity = Self::effective_capacity(capacity) as u64;
        let required = std::mem::size_of::<EtherHeader>() + capacity as usize * Self::SLOT_SIZE;
        if region.len() < required {
            return Err(EtherError::RegionTooSmall {
                required,
                actual: region.len(),
            });
        }

        let base = region.ptr();
        let hdr = base.cast::<EtherHeader>();
        let slots = unsafe { NonNull::new_unchecked(base.as_ptr().add(std::mem::size_of::<EtherHeader>())) };

        unsafe {
            if reset {
                std::ptr::write_bytes(base.as_ptr(), 0, required);
                let h = hdr.as_ptr();
                (*h).seqno = AtomicU64::new(0);
                (*h).signature = L::SIGNATURE;
                (*h).capacity = capacity;
            } else {
                let h = &*hdr.as_ptr();
                if h.signature != L::SIGNATURE {
                    return Err(EtherError::SignatureMismatch {
                        expected: L::SIGNATURE,
                        found: h.signature,
                    });
                }
                if h.capacity != capacity {
                    return Err(EtherError::CapacityMismatch {
                        expected: capacity,
                        found: h.capacity,
                    });
                }
            }
        }

        Ok(Arc::new(Self {
            hdr,
            slots,
            capacity,
            mask: capacity - 1,
            slot_size: Self::SLOT_SIZE,
            _region: region,
            _marker: PhantomData,
        }))
    }

    #[inline(always)]
    fn header(&self) -> &EtherHeader {
        unsafe { self.hdr.as_ref() }
    }

    #[inline(always)]
    unsafe fn ctrl(&self, seqno: u64) -> *mut SlotControl {
        self.slots
            .as_ptr()
            .add((seqno & self.mask) as usize * self.slot_size) as *mut SlotControl
    }

    #[inline(always)]
    unsafe fn data(&self, seqno: u64) -> *mut u8 {
        self.slots
            .as_ptr()
            .add((seqno & self.mask) as usize * self.slot_size + DATA_OFFSET)
    }

    /// Effective slot count.
    #[inline(always)]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Last published sequence number.
    #[inline(always)]
    pub fn published(&self) -> u64 {
        self.header().seqno.load(Ordering::Relaxed)
    }

    /// Claims the next sequence number and constructs `msg` in its slot,
    /// returning the in-slot reference for further in-place edits.
    ///
    /// The slot is not visible to readers until [`commit`](Self::commit).
    /// Skipping the commit leaves a permanent hole readers will never
    /// deliver, so always pair the two.
    #[inline(always)]
    pub fn allocate<M: Message>(&self, msg: M) -> &mut M
    where
        L: Member<M>,
    {
        debug_assert!(std::mem::align_of::<M>() <= CACHE_LINE);
        let hdr = self.header();
        let mut prev = hdr.seqno.load(Ordering::Relaxed);
        loop {
            match hdr.seqno.compare_exchange_weak(
                prev,
                prev + 1,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(cur) => prev = cur,
            }
        }
        let seqno = prev + 1;

        unsafe {
            let ctrl = self.ctrl(seqno);
            (*ctrl).commitno.store(0, Ordering::Relaxed);
            (*ctrl).seqno.store(seqno, Ordering::Release);
            let data = self.data(seqno);
            std::ptr::write_bytes(data, 0, std::mem::size_of::<M>());
            let payload = data as *mut M;
            payload.write(msg);
            &mut *payload
        }
    }

    /// Publishes a slot previously returned by [`allocate`](Self::allocate).
    ///
    /// Records the message selector and releases the commit number; readers
    /// at this sequence number deliver the slot from here on.
    #[inline(always)]
    pub fn commit<M: Message>(&self, msg: &mut M) -> bool
    where
        L: Member<M>,
    {
        unsafe {
            let ctrl = (msg as *mut M as *mut u8).sub(DATA_OFFSET) as *mut SlotControl;
            (*ctrl).selector = <L as Member<M>>::ORDINAL;
            let seqno = (*ctrl).seqno.load(Ordering::Relaxed);
            (*ctrl).commitno.store(seqno, Ordering::Release);
        }
        true
    }

    /// Allocates, fills and commits in one step. Returns the published
    /// sequence number.
    #[inline(always)]
    pub fn publish<M: Message>(&self, msg: M) -> u64
    where
        L: Member<M>,
    {
        let slot = self.allocate(msg) as *mut M;
        let seqno = unsafe {
            let ctrl = (slot as *mut u8).sub(DATA_OFFSET) as *mut SlotControl;
            (*ctrl).seqno.load(Ordering::Relaxed)
        };
        self.commit(unsafe { &mut *slot });
        seqno
    }
}

/// A consumer's position in an ether.
///
/// A freshly constructed cursor starts right after the latest publication;
/// it never sees history. Each consumer needs its own cursor: cursors track
/// independent positions and never interfere with each other or with
/// producers.
#[derive(Debug)]
pub struct Cursor<L: MessageSet> {
    ether: Arc<Ether<L>>,
    /// Next sequence number to deliver.
    next_seqno: u64,
    /// Latest header snapshot; backpressure metric only.
    last_seqno: u64,
}

impl<L: MessageSet> Cursor<L> {
    pub fn new(ether: Arc<Ether<L>>) -> Self {
        let last_seqno = ether.header().seqno.load(Ordering::Acquire);
        Self {
            ether,
            next_seqno: last_seqno + 1,
            last_seqno,
        }
    }

    /// Delivers at most one message to `visitor`, decoded to its concrete
    /// member type.
    ///
    /// This is the dispatch entry point: the selector resolves once, and
    /// the visitor sees a typed payload reference valid for the duration
    /// of the call.
    #[inline(always)]
    pub fn read_into<V: MemberVisitor<L>>(&mut self, visitor: &mut V) -> Read {
        self.last_seqno = self.ether.header().seqno.load(Ordering::Relaxed);
        if self.last_seqno < self.next_seqno {
            return Read::Empty;
        }
        if self.last_seqno - self.next_seqno >= self.ether.capacity {
            return Read::Lapped;
        }
        unsafe {
            let ctrl = self.ether.ctrl(self.next_seqno);
            if (*ctrl).seqno.load(Ordering::Acquire) == self.next_seqno
                && (*ctrl).commitno.load(Ordering::Acquire) == self.next_seqno
            {
                L::visit((*ctrl).selector, self.ether.data(self.next_seqno), visitor);
                self.next_seqno += 1;
                return Read::Delivered;
            }
        }
        Read::Empty
    }

    /// Delivers at most one message to `handler` as the borrowed tagged
    /// view; the reference is only valid for the duration of the call.
    #[inline(always)]
    pub fn read<F>(&mut self, handler: F) -> Read
    where
        F: for<'a> FnOnce(L::Ref<'a>),
    {
        struct Tagged<F>(Option<F>);

        impl<L2: MessageSet, F: for<'a> FnOnce(L2::Ref<'a>)> MemberVisitor<L2> for Tagged<F> {
            fn visit<M: Message>(&mut self, msg: &M)
            where
                L2: Member<M>,
            {
                let handler = self.0.take().expect("at most one delivery per read");
                let view = unsafe {
                    L2::decode(<L2 as Member<M>>::ORDINAL, (msg as *const M).cast())
                };
                handler(view);
            }
        }

        self.read_into(&mut Tagged(Some(handler)))
    }

    /// Publications not yet consumed as of the last header snapshot.
    #[inline(always)]
    pub fn backlog(&self) -> u64 {
        self.ether
            .header()
            .seqno
            .load(Ordering::Relaxed)
            .saturating_sub(self.last_seqno)
    }

    /// Sequence number of the next delivery.
    #[inline(always)]
    pub fn next_seqno(&self) -> u64 {
        self.next_seqno
    }

    pub fn ether(&self) -> &Arc<Ether<L>> {
        &self.ether
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    #[repr(C)]
    struct Alpha {
        x: u64,
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    #[repr(C)]
    struct Beta {
        y: u64,
        z: u32,
    }

    crate::impl_message!(Alpha, Beta);

    crate::message_set! {
        set PairSet(PairRef) { Alpha, Beta }
    }

    crate::message_set! {
        set AlphaOnly(AlphaOnlyRef) { Alpha }
    }

    fn scratch_path(name: &str) -> String {
        let mut p = std::env::temp_dir();
        p.push(format!("etherbus-ether-{}-{}", std::process::id(), name));
        p.to_string_lossy().into_owned()
    }

    /// Drains everything currently readable into (discriminant, value) pairs.
    fn drain(cursor: &mut Cursor<PairSet>) -> Vec<(char, u64)> {
        let mut out = Vec::new();
        loop {
            let rc = cursor.read(|view| match view {
                PairRef::Alpha(a) => out.push(('a', a.x)),
                PairRef::Beta(b) => out.push(('b', b.y)),
            });
            match rc {
                Read::Delivered => continue,
                Read::Empty => break,
                Read::Lapped => panic!("unexpected lap"),
            }
        }
        out
    }

    #[test]
    fn layout_constants() {
        // Payload of PairSet is 16 bytes; one control line + one data line.
        assert_eq!(Ether::<PairSet>::SLOT_SIZE, 128);
        assert_eq!(
            Ether::<PairSet>::required_mem_size(16),
            64 + 16 * Ether::<PairSet>::SLOT_SIZE
        );
        // Requested capacities round up to powers of two.
        assert_eq!(Ether::<PairSet>::effective_capacity(0), 2);
        assert_eq!(Ether::<PairSet>::effective_capacity(9), 16);
    }

    #[test]
    fn spsc_roundtrip_in_publication_order() {
        let ether = Ether::<PairSet>::private(16).unwrap();
        let mut cursor = Cursor::new(ether.clone());

        ether.publish(Alpha { x: 1 });
        ether.publish(Beta { y: 2, z: 0 });
        ether.publish(Alpha { x: 3 });

        assert_eq!(drain(&mut cursor), vec![('a', 1), ('b', 2), ('a', 3)]);
        assert_eq!(cursor.read(|_| panic!("nothing left")), Read::Empty);
    }

    #[test]
    fn cursor_starts_after_latest_publication() {
        let ether = Ether::<PairSet>::private(16).unwrap();

        ether.publish(Alpha { x: 1 });
        let mut mid = Cursor::new(ether.clone());
        ether.publish(Beta { y: 2, z: 0 });
        let mut late = Cursor::new(ether.clone());
        ether.publish(Alpha { x: 3 });

        assert_eq!(drain(&mut mid), vec![('b', 2), ('a', 3)]);
        assert_eq!(drain(&mut late), vec![('a', 3)]);
    }

    #[test]
    fn exactly_capacity_publications_are_all_delivered() {
        let ether = Ether::<PairSet>::private(8).unwrap();
        let mut cursor = Cursor::new(ether.clone());

        for i in 0..8 {
            ether.publish(Alpha { x: i });
        }

        let got = drain(&mut cursor);
        assert_eq!(got.len(), 8);
        for (i, (tag, x)) in got.into_iter().enumerate() {
            assert_eq!(tag, 'a');
            assert_eq!(x, i as u64);
        }
    }

    #[test]
    fn lap_overrun_is_reported() {
        let ether = Ether::<PairSet>::private(8).unwrap();
        let mut cursor = Cursor::new(ether.clone());

        for i in 0..10 {
            ether.publish(Alpha { x: i });
        }

        assert_eq!(cursor.read(|_| panic!("must not deliver")), Read::Lapped);
    }

    #[test]
    fn allocate_without_commit_is_invisible() {
        let ether = Ether::<PairSet>::private(8).unwrap();
        let mut cursor = Cursor::new(ether.clone());

        let slot = ether.allocate(Alpha { x: 7 });
        assert_eq!(cursor.read(|_| panic!("uncommitted")), Read::Empty);

        ether.commit(slot);
        assert_eq!(drain(&mut cursor), vec![('a', 7)]);
    }

    #[test]
    fn allocate_returns_editable_slot() {
        let ether = Ether::<PairSet>::private(8).unwrap();
        let mut cursor = Cursor::new(ether.clone());

        let slot = ether.allocate(Beta { y: 0, z: 0 });
        slot.y = 42;
        slot.z = 9;
        ether.commit(slot);

        cursor.read(|view| match view {
            PairRef::Beta(b) => {
                assert_eq!(b.y, 42);
                assert_eq!(b.z, 9);
            }
            other => panic!("wrong variant: {:?}", other),
        });
    }

    #[test]
    fn multi_producer_total_order() {
        const PER_PRODUCER: u64 = 100;
        let ether = Ether::<PairSet>::private(256).unwrap();
        let mut cursor = Cursor::new(ether.clone());

        let handles: Vec<_> = (0..2u64)
            .map(|id| {
                let ether = ether.clone();
                std::thread::spawn(move || {
                    for i in 1..=PER_PRODUCER {
                        // Payload: producer id in the low bit, local counter above.
                        ether.publish(Alpha { x: (i << 1) | id });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(ether.published(), 2 * PER_PRODUCER);

        let mut counters = [0u64; 2];
        let mut delivered = 0;
        loop {
            let rc = cursor.read(|view| match view {
                PairRef::Alpha(a) => {
                    let id = (a.x & 1) as usize;
                    let count = a.x >> 1;
                    // Each producer's stream must arrive in its own order.
                    assert_eq!(count, counters[id] + 1);
                    counters[id] = count;
                }
                other => panic!("wrong variant: {:?}", other),
            });
            match rc {
                Read::Delivered => delivered += 1,
                Read::Empty => break,
                Read::Lapped => panic!("unexpected lap"),
            }
        }
        assert_eq!(delivered, 2 * PER_PRODUCER);
        assert_eq!(counters, [PER_PRODUCER, PER_PRODUCER]);
        assert_eq!(cursor.next_seqno(), 2 * PER_PRODUCER + 1);
    }

    #[test]
    fn shared_attach_validates_signature() {
        let path = scratch_path("signature");
        let ether = Ether::<PairSet>::shared(&path, 16, true).unwrap();
        ether.publish(Alpha { x: 5 });
        drop(ether);

        match Ether::<AlphaOnly>::shared(&path, 16, false) {
            Err(EtherError::SignatureMismatch { expected, found }) => {
                assert_eq!(expected, AlphaOnly::SIGNATURE);
                assert_eq!(found, PairSet::SIGNATURE);
            }
            other => panic!("expected signature mismatch, got {:?}", other.map(|_| ())),
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn shared_attach_validates_capacity() {
        let path = scratch_path("capacity");
        drop(Ether::<PairSet>::shared(&path, 32, true).unwrap());

        // The file is large enough for the smaller ring, so only the
        // capacity check can reject this.
        match Ether::<PairSet>::shared(&path, 16, false) {
            Err(EtherError::CapacityMismatch { expected, found }) => {
                assert_eq!(expected, 16);
                assert_eq!(found, 32);
            }
            other => panic!("expected capacity mismatch, got {:?}", other.map(|_| ())),
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn shared_attach_resumes_stream() {
        let path = scratch_path("resume");
        let writer = Ether::<PairSet>::shared(&path, 16, true).unwrap();
        writer.publish(Alpha { x: 11 });

        // A second attach without reset sees the same ring and continues
        // the same sequence numbering.
        let reader = Ether::<PairSet>::shared(&path, 16, false).unwrap();
        assert_eq!(reader.published(), 1);

        let mut cursor = Cursor::new(reader.clone());
        writer.publish(Alpha { x: 12 });
        assert_eq!(drain(&mut cursor), vec![('a', 12)]);

        drop(writer);
        drop(reader);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn attach_rejects_short_region() {
        let region = Region::anonymous(128).unwrap();
        match Ether::<PairSet>::attach(region, 16, true) {
            Err(EtherError::RegionTooSmall { required, actual }) => {
                assert_eq!(actual, 128);
                assert_eq!(required, Ether::<PairSet>::required_mem_size(16));
            }
            other => panic!("expected region-too-small, got {:?}", other.map(|_| ())),
        }
    }
}
