//! Message typing for ethers.
//!
//! Every ether carries a closed set of message types fixed at declaration.
//! The set is described by a zero-sized marker type implementing
//! [`MessageSet`]; the [`message_set!`] macro generates the marker, a
//! borrowed tagged view over committed slots, a per-member ordinal (its
//! index in declaration order) and the 64-bit set signature stamped into
//! the ether header.
//!
//! The signature is an FNV-1a fold over the members in declaration order,
//! mixing each member's name hash with its size. Two sets differing in type
//! identity, size, or order produce different signatures, which is what
//! makes a stale shared-memory attach fail loudly instead of misreading
//! slots.

/// A payload type carried by an ether.
///
/// Messages live directly inside shared-memory slots, so they must be
/// trivially copyable and self-contained: no owning pointers, no drop
/// logic. Types intended for cross-process ethers should also be
/// `#[repr(C)]` so both sides agree on layout.
pub trait Message: Copy + Send + 'static {
    /// Stable name folded into the set signature. Keep it equal to the
    /// type's declared name; renaming a message intentionally invalidates
    /// existing shared-memory regions.
    const NAME: &'static str;
}

/// Marker type describing one ether's closed message set.
///
/// Implementations are generated by [`message_set!`]; writing one by hand
/// is possible but there is rarely a reason to.
pub trait MessageSet: Copy + Send + Sync + 'static {
    /// Number of member types.
    const COUNT: usize;

    /// Size of the largest member; dictates the slot data size.
    const MAX_SIZE: usize;

    /// 64-bit signature over the declaration-ordered member list.
    const SIGNATURE: u64;

    /// Borrowed tagged view of a committed slot, one variant per member.
    type Ref<'a>: Copy;

    /// Reinterprets committed slot bytes as the member with the given
    /// ordinal.
    ///
    /// # Safety
    ///
    /// `selector` must be the ordinal stored at commit time and `data` must
    /// point at a fully committed payload of that member type, valid for
    /// reads for the duration of `'a`.
    unsafe fn decode<'a>(selector: u16, data: *const u8) -> Self::Ref<'a>;

    /// Hands the committed payload to `visitor` as its concrete member
    /// type. The selector match compiles to a jump; everything after it is
    /// monomorphized per member.
    ///
    /// # Safety
    ///
    /// Same contract as [`decode`](Self::decode).
    unsafe fn visit<V: MemberVisitor<Self>>(selector: u16, data: *const u8, visitor: &mut V)
    where
        Self: Sized;
}

/// Receives one decoded payload as its concrete member type.
///
/// This is the statically-typed half of dispatch: [`MessageSet::visit`]
/// resolves the selector once, then calls `visit::<M>` for the one member
/// the slot holds.
pub trait MemberVisitor<L: MessageSet> {
    fn visit<M: Message>(&mut self, msg: &M)
    where
        L: Member<M>;
}

/// Implemented by a set marker for each of its members; `ORDINAL` is the
/// member's index in declaration order and doubles as the slot selector.
pub trait Member<M: Message>: MessageSet {
    const ORDINAL: u16;
}

/// FNV-1a 64-bit hash, usable in const context.
pub const fn fnv1a(s: &str) -> u64 {
    let bytes = s.as_bytes();
    let mut hash = 0xcbf29ce484222325u64;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(0x100000001b3);
        i += 1;
    }
    hash
}

/// Folds one member's contribution into a set signature. Exposed for the
/// macro expansion; not part of the public surface proper.
#[doc(hidden)]
pub const fn fold_signature(hash: u64, name: &str, size: usize) -> u64 {
    (hash ^ (fnv1a(name) ^ ((size as u64) << 1))).wrapping_mul(0x100000001b3)
}

#[doc(hidden)]
pub const SIGNATURE_SEED: u64 = 0xcbf29ce484222325;

/// Implements [`Message`] for one or more plain `Copy` types, using the
/// type's own name.
#[macro_export]
macro_rules! impl_message {
    ($($msg:ident),+ $(,)?) => {
        $(
            impl $crate::message::Message for $msg {
                const NAME: &'static str = stringify!($msg);
            }
        )+
    };
}

/// Declares a message set: the marker type, the borrowed view enum, member
/// ordinals and the set signature.
///
/// ```ignore
/// message_set! {
///     /// Messages on the order path.
///     pub set OrderPath(OrderPathRef) { NewOrder, CancelOrder, Execution }
/// }
/// ```
///
/// Members are listed in declaration order; the order is part of the wire
/// contract. Listing a member twice fails to compile (conflicting `Member`
/// implementations).
#[macro_export]
macro_rules! message_set {
    (
        $(#[$meta:meta])*
        $vis:vis set $set:ident ( $ref_name:ident ) { $($msg:ident),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        $vis struct $set;

        /// Borrowed view of one committed slot, tagged by message type.
        #[derive(Clone, Copy, Debug)]
        $vis enum $ref_name<'a> {
            $($msg(&'a $msg),)+
        }

        impl $crate::message::MessageSet for $set {
            const COUNT: usize = 0 $(+ { let _ = stringify!($msg); 1 })+;

            const MAX_SIZE: usize = {
                let mut max = 0;
                $(
                    if ::core::mem::size_of::<$msg>() > max {
                        max = ::core::mem::size_of::<$msg>();
                    }
                )+
                max
            };

            const SIGNATURE: u64 = {
                let mut hash = $crate::message::SIGNATURE_SEED;
                $(
                    hash = $crate::message::fold_signature(
                        hash,
                        <$msg as $crate::message::Message>::NAME,
                        ::core::mem::size_of::<$msg>(),
                    );
                )+
                hash
            };

            type Ref<'a> = $ref_name<'a>;

            #[inline(always)]
            unsafe fn decode<'a>(selector: u16, data: *const u8) -> Self::Ref<'a> {
                $(
                    if selector == <$set as $crate::message::Member<$msg>>::ORDINAL {
                        return $ref_name::$msg(&*(data as *const $msg));
                    }
                )+
                unreachable!("selector {} is not a member of {}", selector, stringify!($set));
            }

            #[inline(always)]
            unsafe fn visit<V: $crate::message::MemberVisitor<Self>>(
                selector: u16,
                data: *const u8,
                visitor: &mut V,
            ) {
                $(
                    if selector == <$set as $crate::message::Member<$msg>>::ORDINAL {
                        return visitor.visit::<$msg>(&*(data as *const $msg));
                    }
                )+
                unreachable!("selector {} is not a member of {}", selector, stringify!($set));
            }
        }

        $crate::message_set!(@members $set ; 0u16 ; $($msg),+);
    };

    (@members $set:ident ; $idx:expr ; $head:ident $(, $tail:ident)*) => {
        impl $crate::message::Member<$head> for $set {
            const ORDINAL: u16 = $idx;
        }
        $crate::message_set!(@members $set ; $idx + 1 ; $($tail),*);
    };
    (@members $set:ident ; $idx:expr ;) => {};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    #[repr(C)]
    struct Quote {
        bid: u64,
        ask: u64,
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    #[repr(C)]
    struct Trade {
        price: u64,
        qty: u32,
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    #[repr(C)]
    struct Heartbeat {
        epoch: u64,
    }

    crate::impl_message!(Quote, Trade, Heartbeat);

    crate::message_set! {
        pub set FeedSet(FeedRef) { Quote, Trade, Heartbeat }
    }

    crate::message_set! {
        pub set ReorderedSet(ReorderedRef) { Trade, Quote, Heartbeat }
    }

    crate::message_set! {
        pub set SmallerSet(SmallerRef) { Quote, Trade }
    }

    #[test]
    fn ordinals_follow_declaration_order() {
        assert_eq!(<FeedSet as Member<Quote>>::ORDINAL, 0);
        assert_eq!(<FeedSet as Member<Trade>>::ORDINAL, 1);
        assert_eq!(<FeedSet as Member<Heartbeat>>::ORDINAL, 2);
        assert_eq!(FeedSet::COUNT, 3);
    }

    #[test]
    fn max_size_is_largest_member() {
        assert_eq!(FeedSet::MAX_SIZE, std::mem::size_of::<Quote>());
        assert!(FeedSet::MAX_SIZE >= std::mem::size_of::<Trade>());
    }

    #[test]
    fn signature_is_stable() {
        assert_eq!(FeedSet::SIGNATURE, FeedSet::SIGNATURE);
        assert_ne!(FeedSet::SIGNATURE, 0);
    }

    #[test]
    fn signature_depends_on_member_order() {
        assert_ne!(FeedSet::SIGNATURE, ReorderedSet::SIGNATURE);
    }

    #[test]
    fn signature_depends_on_membership() {
        assert_ne!(FeedSet::SIGNATURE, SmallerSet::SIGNATURE);
    }

    #[test]
    fn signature_depends_on_name() {
        // Same sizes, different names: the fold must differ.
        let a = fold_signature(SIGNATURE_SEED, "Quote", 16);
        let b = fold_signature(SIGNATURE_SEED, "Quota", 16);
        assert_ne!(a, b);
    }

    #[test]
    fn signature_depends_on_size() {
        let a = fold_signature(SIGNATURE_SEED, "Quote", 16);
        let b = fold_signature(SIGNATURE_SEED, "Quote", 24);
        assert_ne!(a, b);
    }

    #[test]
    fn decode_reinterprets_payload_by_ordinal() {
        let trade = Trade {
            price: 995,
            qty: 40,
        };
        let view = unsafe {
            FeedSet::decode(
                <FeedSet as Member<Trade>>::ORDINAL,
                &trade as *const Trade as *const u8,
            )
        };
        match view {
            FeedRef::Trade(t) => {
                assert_eq!(t.price, 995);
                assert_eq!(t.qty, 40);
            }
            other => panic!("decoded wrong variant: {:?}", other),
        }
    }

    #[test]
    fn visit_hands_out_the_concrete_member() {
        struct NameAndOrdinal {
            seen: Option<(&'static str, u16, usize)>,
        }

        impl MemberVisitor<FeedSet> for NameAndOrdinal {
            fn visit<M: Message>(&mut self, msg: &M)
            where
                FeedSet: Member<M>,
            {
                self.seen = Some((
                    M::NAME,
                    <FeedSet as Member<M>>::ORDINAL,
                    std::mem::size_of_val(msg),
                ));
            }
        }

        let trade = Trade { price: 7, qty: 21 };
        let mut visitor = NameAndOrdinal { seen: None };
        unsafe {
            FeedSet::visit(
                <FeedSet as Member<Trade>>::ORDINAL,
                &trade as *const Trade as *const u8,
                &mut visitor,
            );
        }
        assert_eq!(
            visitor.seen,
            Some(("Trade", 1, std::mem::size_of::<Trade>()))
        );
    }

    #[test]
    fn fnv1a_matches_reference_vectors() {
        // Standard FNV-1a 64 test vectors.
        assert_eq!(fnv1a(""), 0xcbf29ce484222325);
        assert_eq!(fnv1a("a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv1a("foobar"), 0x85944171f73967e8);
    }
}
