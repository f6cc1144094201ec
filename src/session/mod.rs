//! Process-wide session activity state.
//!
//! The helper tells us when the user switches VTs away from (DEACTIVATE) or
//! back to (ACTIVATE) this session. Backends must stop scanning out and
//! release device mastership while inactive, so they observe transitions
//! through this handle. Single-writer contract: only the launcher connection
//! flips the flag; everything else is a read-only observer.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::debug;

struct SessionState {
    active: Cell<bool>,
    observers: RefCell<Vec<Box<dyn Fn(bool)>>>,
}

/// Cheaply clonable handle on the session-active flag.
///
/// Starts out active: the session is launched on its own VT, which is the
/// foreground console at that point.
#[derive(Clone)]
pub struct SessionHandle {
    state: Rc<SessionState>,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self {
            state: Rc::new(SessionState {
                active: Cell::new(true),
                observers: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.active.get()
    }

    /// Register an observer, called synchronously on every session-state
    /// signal with the new value.
    pub fn observe(&self, observer: impl Fn(bool) + 'static) {
        self.state.observers.borrow_mut().push(Box::new(observer));
    }

    /// Flip the flag and signal observers. Signals are per protocol message,
    /// so observers may see the same value twice in a row.
    pub(crate) fn set_active(&self, active: bool) {
        debug!("session {}", if active { "activated" } else { "deactivated" });
        self.state.active.set(active);
        for observer in self.state.observers.borrow().iter() {
            observer(active);
        }
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}
