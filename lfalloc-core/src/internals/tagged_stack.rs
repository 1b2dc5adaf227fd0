//! A lock-free stack of indices, immune to ABA.
//!
//! The elements of the stack are designated by 32-bits indices, and the links between them are stored externally, in
//! a location provided by the owner of the elements through the `StackLinks` trait.
//!
//! The head of the stack is a single 64-bits word packing the index of the top element with a generation. Every
//! successful modification of the head increments the generation, hence a thread holding a stale snapshot of the head
//! can never successfully swap it, even if the very same index was popped and pushed back in the meantime.
//!
//! A generation only wraps around after 2^32 modifications, which a thread would need to sleep through between its
//! load and its compare-and-swap.

use core::fmt;

use super::atomic::Atomic;

/// The storage of the links between elements.
///
/// #   Safety
///
/// -   `link(i)` must return the same atomic, for a given `i`, for as long as `i` may be within the stack.
/// -   Said atomic must remain valid to read even after `i` was popped, as a concurrent `pop` may still read it.
pub unsafe trait StackLinks {
    /// Returns the link of the element at `index`.
    fn link(&self, index: u32) -> &Atomic<u32>;
}

/// TaggedStack
///
/// A Treiber stack of indices, with a versioned head.
pub struct TaggedStack(Atomic<u64>);

impl TaggedStack {
    /// The null index, marking the bottom of the stack.
    pub const NULL: u32 = u32::MAX;

    /// Creates an empty instance.
    pub fn new() -> Self { Self(Atomic::new(Head::new(Self::NULL, 0).pack())) }

    /// Returns whether the stack is empty, at the instant of the check.
    pub fn is_empty(&self) -> bool { Head::unpack(self.0.load()).index == Self::NULL }

    /// Returns the current generation of the head, which is incremented by every modification.
    pub fn generation(&self) -> u32 { Head::unpack(self.0.load()).generation }

    /// Pops the top element, if any.
    ///
    /// The returned index, if any, is exclusively owned by the caller.
    pub fn pop<L: StackLinks + ?Sized>(&self, links: &L) -> Option<u32> {
        let mut current = self.0.load();

        loop {
            let head = Head::unpack(current);

            if head.index == Self::NULL {
                return None;
            }

            //  WARNING:
            //
            //  Another thread may pop `head.index` and start using it prior to the compare-and-swap below, in which
            //  case `next` is garbage. It is then discarded, since the generation will have moved on.
            let next = links.link(head.index).load();

            match self.0.compare_and_swap_read(head.next(next).pack(), current) {
                Ok(_) => return Some(head.index),
                Err(observed) => current = observed,
            }
        }
    }

    /// Pushes `index` on top.
    ///
    /// #   Safety
    ///
    /// -   `index` must be exclusively owned by the caller, not already in the stack.
    /// -   `index` must not be `Self::NULL`.
    pub unsafe fn push<L: StackLinks + ?Sized>(&self, index: u32, links: &L) {
        self.push_chain(index, index, links);
    }

    /// Pushes the chain `first` to `last` on top, with a single modification of the head.
    ///
    /// The chain must already be linked, from `first` to `last`; the link of `last` is overwritten.
    ///
    /// #   Safety
    ///
    /// -   All elements of the chain must be exclusively owned by the caller, not already in the stack.
    /// -   `first` and `last` must not be `Self::NULL`.
    pub unsafe fn push_chain<L: StackLinks + ?Sized>(&self, first: u32, last: u32, links: &L) {
        debug_assert_ne!(Self::NULL, first);
        debug_assert_ne!(Self::NULL, last);

        let tail = links.link(last);

        let mut current = self.0.load();

        loop {
            let head = Head::unpack(current);

            tail.store(head.index);

            match self.0.compare_and_swap_read(head.next(first).pack(), current) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

impl Default for TaggedStack {
    fn default() -> Self { Self::new() }
}

impl fmt::Debug for TaggedStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = Head::unpack(self.0.load());

        f.debug_struct("TaggedStack")
            .field("top", &head.index)
            .field("generation", &head.generation)
            .finish()
    }
}

//
//  Implementation
//

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Head {
    index: u32,
    generation: u32,
}

impl Head {
    fn new(index: u32, generation: u32) -> Self { Self { index, generation, } }

    //  The head which replaces `self`, with `index` on top.
    fn next(self, index: u32) -> Self { Self::new(index, self.generation.wrapping_add(1)) }

    fn pack(self) -> u64 { (self.generation as u64) << 32 | self.index as u64 }

    fn unpack(packed: u64) -> Self { Self::new(packed as u32, (packed >> 32) as u32) }
}

#[cfg(test)]
mod tests {

use lfalloc_test::LockstepBuilder;

use super::*;

struct Links(Vec<Atomic<u32>>);

impl Links {
    fn new(n: usize) -> Self { Self((0..n).map(|_| Atomic::new(TaggedStack::NULL)).collect()) }
}

unsafe impl StackLinks for Links {
    fn link(&self, index: u32) -> &Atomic<u32> { &self.0[index as usize] }
}

#[test]
fn tagged_stack_head_pack_unpack() {
    let head = Head::new(0x1234_5678, 0x9abc_def0);

    assert_eq!(0x9abc_def0_1234_5678, head.pack());
    assert_eq!(head, Head::unpack(head.pack()));

    assert_eq!(Head::new(3, 0), Head::new(7, u32::MAX).next(3));
}

#[test]
fn tagged_stack_single_word() {
    assert_eq!(8, core::mem::size_of::<TaggedStack>());
    assert_eq!(core::mem::align_of::<Atomic<u64>>(), core::mem::align_of::<TaggedStack>());
}

#[test]
fn tagged_stack_pop_empty() {
    let links = Links::new(0);
    let stack = TaggedStack::new();

    assert!(stack.is_empty());
    assert_eq!(None, stack.pop(&links));
    assert_eq!(0, stack.generation());
}

#[test]
fn tagged_stack_push_pop_lifo() {
    let links = Links::new(3);
    let stack = TaggedStack::new();

    unsafe {
        stack.push(0, &links);
        stack.push(2, &links);
        stack.push(1, &links);
    }

    assert!(!stack.is_empty());
    assert_eq!(3, stack.generation());

    assert_eq!(Some(1), stack.pop(&links));
    assert_eq!(Some(2), stack.pop(&links));
    assert_eq!(Some(0), stack.pop(&links));
    assert_eq!(None, stack.pop(&links));

    assert!(stack.is_empty());
    assert_eq!(6, stack.generation());
}

#[test]
fn tagged_stack_push_chain() {
    let links = Links::new(4);
    let stack = TaggedStack::new();

    unsafe { stack.push(3, &links) };

    //  Chain: 0 -> 1 -> 2.
    links.link(0).store(1);
    links.link(1).store(2);

    unsafe { stack.push_chain(0, 2, &links) };

    assert_eq!(2, stack.generation());

    let popped: Vec<_> = core::iter::from_fn(|| stack.pop(&links)).collect();

    assert_eq!(vec!(0, 1, 2, 3), popped);
}

#[test]
fn tagged_stack_stale_snapshot_fails() {
    //  A snapshot taken before a pop/push of the same index must not be swappable.
    let links = Links::new(2);
    let stack = TaggedStack::new();

    unsafe {
        stack.push(1, &links);
        stack.push(0, &links);
    }

    let stale = stack.0.load();

    assert_eq!(Some(0), stack.pop(&links));
    unsafe { stack.push(0, &links) };

    assert_eq!(Head::unpack(stale).index, Head::unpack(stack.0.load()).index);
    assert!(!stack.0.compare_and_swap(Head::unpack(stale).next(1).pack(), stale));
}

#[test]
fn tagged_stack_concurrent_pop_push_fuzzing() {
    //  The test aims at validating that no element is ever owned by two threads at once, despite a small shared set
    //  of elements being popped and pushed back in quick succession.
    //
    //  To do so:
    //  -   Each element has an ownership flag, set on pop and reset before push; setting an already set flag means
    //      two threads popped the same element.
    //  -   Each push is stamped with a ticket from a global counter; the stamps of a given element must strictly
    //      increase, or a stale push overwrote a newer one.
    const ELEMENTS: usize = 3;

    struct Global {
        stack: TaggedStack,
        links: Links,
        owned: Vec<Atomic<u8>>,
        stamps: Vec<Atomic<u64>>,
        tickets: Atomic<u64>,
    }

    impl Global {
        fn new() -> Self {
            let global = Self {
                stack: TaggedStack::new(),
                links: Links::new(ELEMENTS),
                owned: (0..ELEMENTS).map(|_| Atomic::new(0)).collect(),
                stamps: (0..ELEMENTS).map(|_| Atomic::new(0)).collect(),
                tickets: Atomic::new(1),
            };

            for index in 0..ELEMENTS {
                unsafe { global.stack.push(index as u32, &global.links) };
            }

            global
        }

        fn pop(&self) -> Option<u32> {
            let index = self.stack.pop(&self.links)?;

            assert!(!self.owned[index as usize].bit_test_and_set(0), "{} popped twice", index);

            Some(index)
        }

        fn push(&self, index: u32) {
            let ticket = self.tickets.fetch_add(1);
            let previous = self.stamps[index as usize].fetch_exchange(ticket);

            assert!(previous < ticket, "{}: {} >= {}", index, previous, ticket);
            assert!(self.owned[index as usize].bit_test_and_reset(0), "{} pushed while not owned", index);

            unsafe { self.stack.push(index, &self.links) };
        }
    }

    let mut builder = LockstepBuilder::new(Global::new(), vec!(0usize; 4));

    builder.add_step(|| |global: &Global, _: &mut usize| {
        for _ in 0..1_000 {
            if let Some(index) = global.pop() {
                global.push(index);
            }
        }
    });

    builder.add_step(|| |global: &Global, popped: &mut usize| {
        //  Each thread can grab at most one element, as there are fewer elements than threads.
        if let Some(index) = global.pop() {
            *popped += 1;
            global.push(index);
        }
    });

    let mut lockstep = builder.launch(50);

    let total: usize = lockstep.locals().iter().sum();
    assert!(total > 0);

    let global = lockstep.global();

    assert!(global.owned.iter().all(|owned| owned.load() == 0));
    assert_eq!(ELEMENTS, core::iter::from_fn(|| global.stack.pop(&global.links)).count());
}

} // mod tests
