//! calloop-backed [`Scheduler`].
//!
//! Compositors built on calloop hand the launcher a
//! [`LoopScheduler`] wrapping their `LoopHandle`; fd watches become
//! `Generic` sources and deferred callbacks become idle callbacks, which
//! calloop runs once the current dispatch turn has drained.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsFd, BorrowedFd, RawFd};
use std::rc::Rc;

use calloop::generic::Generic;
use calloop::{Interest, LoopHandle, Mode, PostAction, RegistrationToken};

use super::{Readiness, Scheduler, SourceId};

/// Borrowed view of a descriptor owned by the launcher connection. The
/// connection keeps the fd open until it calls `unwatch`.
struct FdSource(RawFd);

impl AsFd for FdSource {
    fn as_fd(&self) -> BorrowedFd<'_> {
        unsafe { BorrowedFd::borrow_raw(self.0) }
    }
}

/// [`Scheduler`] implementation over a calloop `LoopHandle`.
pub struct LoopScheduler<D: 'static> {
    handle: LoopHandle<'static, D>,
    sources: RefCell<HashMap<u32, RegistrationToken>>,
    next_id: Cell<u32>,
}

impl<D> LoopScheduler<D> {
    pub fn new(handle: LoopHandle<'static, D>) -> Self {
        Self {
            handle,
            sources: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
        }
    }
}

impl<D> Scheduler for LoopScheduler<D> {
    fn watch_fd(&self, fd: RawFd, callback: Rc<dyn Fn(Readiness)>) -> io::Result<SourceId> {
        let source = Generic::new(FdSource(fd), Interest::READ, Mode::Level);
        let token = self
            .handle
            .insert_source(source, move |event, _, _| {
                callback(Readiness {
                    readable: event.readable,
                    hangup: event.error,
                });
                Ok(PostAction::Continue)
            })
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;

        let id = self.next_id.get();
        self.next_id.set(id.wrapping_add(1));
        self.sources.borrow_mut().insert(id, token);
        Ok(SourceId(id))
    }

    fn unwatch(&self, id: SourceId) {
        if let Some(token) = self.sources.borrow_mut().remove(&id.0) {
            self.handle.remove(token);
        }
    }

    fn defer(&self, callback: Box<dyn FnOnce()>) {
        self.handle.insert_idle(move |_| callback());
    }
}
