//! Components and their static fan-out.
//!
//! A component statically declares the subset of its ether's message set
//! it consumes ([`Component::INPUTS`], built with [`inputs!`]). At
//! dispatch time the selector is resolved once, then every component the
//! dispatcher owns is visited: the handler is called for declared input
//! types, and components that do not subscribe to the slot's type are
//! skipped at compile time — the per-pair [`Subscribed`] gate is an
//! associated constant, so a non-subscribing component costs no runtime
//! check at all.
//!
//! Components are owned by exactly one dispatcher and all hooks run on
//! that dispatcher's thread.

use crate::dispatcher::Dispatch;
use crate::message::{Member, Message, MessageSet};
use crate::poller::IoEvent;
use crate::timer::TimerId;
use std::marker::PhantomData;

/// Builds a [`Component::INPUTS`] list from message types.
///
/// ```ignore
/// const INPUTS: &'static [u16] = inputs![OrderPath => NewOrder, Execution];
/// ```
///
/// Naming a type that is not a member of the set fails to compile, so the
/// declared inputs are always a subset of the ether's message list.
#[macro_export]
macro_rules! inputs {
    ($set:ty => $($msg:ty),+ $(,)?) => {
        &[ $( <$set as $crate::message::Member<$msg>>::ORDINAL ),+ ]
    };
}

/// One processing stage wired into a dispatcher.
///
/// `INPUTS` declares which member types reach `process`; only lifecycle
/// hooks run for a component with an empty list. All hooks receive the
/// dispatcher context for publishing messages, arming timers, registering
/// descriptors and reading configuration.
pub trait Component<L: MessageSet>: Send + 'static {
    /// Ordinals of the member types this component consumes. Build with
    /// [`inputs!`]; use `&[]` for a component driven purely by timers,
    /// I/O or batch boundaries.
    const INPUTS: &'static [u16];

    /// Called for every drained message whose type is in `INPUTS`, in
    /// publication order. Types outside the list never arrive here.
    fn process(&mut self, msg: L::Ref<'_>, cx: &mut Dispatch<L>);

    /// Once on the worker thread before the first loop iteration.
    fn process_begin(&mut self, _cx: &mut Dispatch<L>) {}

    /// After every loop iteration.
    fn process_end(&mut self, _cx: &mut Dispatch<L>) {}

    /// After each drained batch, when the dispatcher enables batch-end.
    fn process_batch_end(&mut self, _cx: &mut Dispatch<L>) {}

    /// A timer this component armed has fired.
    fn on_timer(&mut self, _id: TimerId, _cx: &mut Dispatch<L>) {}

    /// A descriptor this component registered is ready.
    fn on_io(&mut self, _event: IoEvent, _cx: &mut Dispatch<L>) {}
}

/// Compile-time predicate: does component `C` subscribe to member `M`?
///
/// `VALUE` is evaluated per monomorphization, so the dispatch fan-out
/// folds a non-subscribing component's branch away entirely.
pub struct Subscribed<C, L, M>(PhantomData<(C, L, M)>);

impl<C, L, M> Subscribed<C, L, M>
where
    C: Component<L>,
    L: MessageSet + Member<M>,
    M: Message,
{
    pub const VALUE: bool = contains(C::INPUTS, <L as Member<M>>::ORDINAL);
}

const fn contains(inputs: &[u16], ordinal: u16) -> bool {
    let mut i = 0;
    while i < inputs.len() {
        if inputs[i] == ordinal {
            return true;
        }
        i += 1;
    }
    false
}

/// A dispatcher's full set of components, visited in declaration order.
///
/// Implemented for tuples of [`Component`]s up to arity 8. Message
/// delivery is generic over the concrete member type so that the
/// [`Subscribed`] gate resolves at compile time per component. Timer and
/// I/O events carry the index of the component that registered them and
/// are routed to that component alone; lifecycle hooks fan out to all
/// members.
pub trait ComponentSet<L: MessageSet>: Send + 'static {
    const LEN: usize;

    fn process_begin(&mut self, cx: &mut Dispatch<L>);

    /// Delivers one decoded message to every member whose declared inputs
    /// contain `M`; the rest are skipped without a runtime check.
    fn deliver<M: Message>(&mut self, msg: &M, cx: &mut Dispatch<L>)
    where
        L: Member<M>;

    fn process_end(&mut self, cx: &mut Dispatch<L>);
    fn process_batch_end(&mut self, cx: &mut Dispatch<L>);
    fn timer(&mut self, owner: usize, id: TimerId, cx: &mut Dispatch<L>);
    fn io(&mut self, owner: usize, event: IoEvent, cx: &mut Dispatch<L>);
}

macro_rules! impl_component_set {
    ($len:expr => $( $c:ident : $idx:tt ),+) => {
        impl<L: MessageSet, $($c: Component<L>),+> ComponentSet<L> for ($($c,)+) {
            const LEN: usize = $len;

            fn process_begin(&mut self, cx: &mut Dispatch<L>) {
                $( cx.set_owner($idx); self.$idx.process_begin(cx); )+
            }

            #[inline(always)]
            fn deliver<M: Message>(&mut self, msg: &M, cx: &mut Dispatch<L>)
            where
                L: Member<M>,
            {
                $(
                    if Subscribed::<$c, L, M>::VALUE {
                        cx.set_owner($idx);
                        let view = unsafe {
                            L::decode(<L as Member<M>>::ORDINAL, (msg as *const M).cast())
                        };
                        self.$idx.process(view, cx);
                    }
                )+
            }

            #[inline(always)]
            fn process_end(&mut self, cx: &mut Dispatch<L>) {
                $( cx.set_owner($idx); self.$idx.process_end(cx); )+
            }

            #[inline(always)]
            fn process_batch_end(&mut self, cx: &mut Dispatch<L>) {
                $( cx.set_owner($idx); self.$idx.process_batch_end(cx); )+
            }

            fn timer(&mut self, owner: usize, id: TimerId, cx: &mut Dispatch<L>) {
                match owner {
                    $( $idx => {
                        cx.set_owner($idx);
                        self.$idx.on_timer(id, cx);
                    } )+
                    _ => {}
                }
            }

            fn io(&mut self, owner: usize, event: IoEvent, cx: &mut Dispatch<L>) {
                match owner {
                    $( $idx => {
                        cx.set_owner($idx);
                        self.$idx.on_io(event, cx);
                    } )+
                    _ => {}
                }
            }
        }
    };
}

impl_component_set!(1 => C0:0);
impl_component_set!(2 => C0:0, C1:1);
impl_component_set!(3 => C0:0, C1:1, C2:2);
impl_component_set!(4 => C0:0, C1:1, C2:2, C3:3);
impl_component_set!(5 => C0:0, C1:1, C2:2, C3:3, C4:4);
impl_component_set!(6 => C0:0, C1:1, C2:2, C3:3, C4:4, C5:5);
impl_component_set!(7 => C0:0, C1:1, C2:2, C3:3, C4:4, C5:5, C6:6);
impl_component_set!(8 => C0:0, C1:1, C2:2, C3:3, C4:4, C5:5, C6:6, C7:7);
