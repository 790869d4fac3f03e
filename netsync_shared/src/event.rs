//! Event broadcasting.
//!
//! In-process fan-out of synchronous callbacks: a list of (handle, function)
//! pairs invoked directly, ordered by registration. `bind` returns an opaque
//! handle to `unbind` with later.

/// Opaque subscription handle returned by [`Event::bind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(u64);

impl EventHandle {
    pub const NULL: EventHandle = EventHandle(0);

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

/// Ordered broadcaster for one event payload type.
pub struct Event<T: ?Sized> {
    subscribers: Vec<(EventHandle, Box<dyn FnMut(&T)>)>,
    next_handle: u64,
}

impl<T: ?Sized> Default for Event<T> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
            next_handle: 1,
        }
    }
}

impl<T: ?Sized> Event<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, callback: impl FnMut(&T) + 'static) -> EventHandle {
        let handle = EventHandle(self.next_handle);
        self.next_handle += 1;
        self.subscribers.push((handle, Box::new(callback)));
        handle
    }

    pub fn unbind(&mut self, handle: EventHandle) {
        self.subscribers.retain(|(h, _)| *h != handle);
    }

    pub fn broadcast(&mut self, payload: &T) {
        for (_, callback) in &mut self.subscribers {
            callback(payload);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn broadcast_is_ordered_by_registration() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut event: Event<u32> = Event::new();

        let a = seen.clone();
        event.bind(move |v| a.borrow_mut().push(("a", *v)));
        let b = seen.clone();
        event.bind(move |v| b.borrow_mut().push(("b", *v)));

        event.broadcast(&7);
        assert_eq!(&*seen.borrow(), &[("a", 7), ("b", 7)]);
    }

    #[test]
    fn unbind_removes_only_that_subscriber() {
        let count = Rc::new(RefCell::new(0));
        let mut event: Event<()> = Event::new();

        let c1 = count.clone();
        let h1 = event.bind(move |_| *c1.borrow_mut() += 1);
        let c2 = count.clone();
        let _h2 = event.bind(move |_| *c2.borrow_mut() += 10);

        event.unbind(h1);
        event.broadcast(&());
        assert_eq!(*count.borrow(), 10);
    }
}
