//! Single-occupant connection slot: the newest connection wins and the
//! previous one is closed.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::channel::Channel;

pub struct SingleSlot<C> {
    current: Mutex<Option<Arc<C>>>,
}

impl<C: Channel> SingleSlot<C> {
    pub fn new() -> Self {
        SingleSlot {
            current: Mutex::new(None),
        }
    }

    /// Install `next` and close whatever it displaced. The close happens
    /// after the lock is released.
    pub fn replace(&self, next: Arc<C>) {
        let previous = self.current.lock().replace(next);
        if let Some(previous) = previous {
            previous.close();
        }
    }

    pub fn current(&self) -> Option<Arc<C>> {
        self.current.lock().clone()
    }

    pub fn is_occupied(&self) -> bool {
        self.current.lock().is_some()
    }

    /// Empty the slot if `channel` still occupies it, closing it. Returns
    /// whether it was still current.
    pub fn release(&self, channel: &Arc<C>) -> bool {
        let released = {
            let mut current = self.current.lock();
            match current.as_ref() {
                Some(c) if Arc::ptr_eq(c, channel) => current.take(),
                _ => None,
            }
        };
        match released {
            Some(c) => {
                c.close();
                true
            }
            None => false,
        }
    }

    /// Close and drop the current occupant, if any.
    pub fn clear(&self) {
        let previous = self.current.lock().take();
        if let Some(previous) = previous {
            previous.close();
        }
    }
}

impl<C: Channel> Default for SingleSlot<C> {
    fn default() -> Self {
        Self::new()
    }
}
