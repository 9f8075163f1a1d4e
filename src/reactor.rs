//! Waiting for I/O and timer events.

use std::{
    cell::{Cell, RefCell},
    io::{Error, ErrorKind, Result},
    marker::PhantomData,
    ops::BitOr,
    os::unix::io::RawFd,
    rc::Rc,
    time::{Duration, Instant},
};

use crate::util::cvt;

/// The kind of I/O readiness notifications.
///
/// A value of this type describes what kind of I/O readiness notifications
/// (such as "you can now read from this socket") a registration is interested
/// in. It is a small bitset: the readable and writable bits can be combined
/// with `|`, and an empty value is a valid (if inert) mask.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    /// Interested in nothing.
    pub const NONE: Interest = Interest(0);
    /// Interested in this file becoming readable.
    pub const READ: Interest = Interest(1);
    /// Interested in this file becoming writable.
    pub const WRITE: Interest = Interest(2);
    /// Interested in this file becoming readable or writable.
    pub const READ_WRITE: Interest = Interest(3);

    /// Whether every bit of `other` is also set in `self`.
    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no bits are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The bits of `self` that are not set in `other`.
    pub fn without(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    fn as_poll_events(self) -> libc::c_short {
        let mut events = 0;
        if self.contains(Interest::READ) {
            events |= libc::POLLIN;
        }
        if self.contains(Interest::WRITE) {
            events |= libc::POLLOUT;
        }
        events
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// Identifier of a timer registration.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TimerId(u64);

/// A callback invoked when a registered file descriptor becomes ready.
///
/// It receives the descriptor and the single direction (either
/// [`Interest::READ`] or [`Interest::WRITE`]) that is ready; a descriptor
/// that is ready in both directions gets two invocations, readable first.
pub type FileCallback = dyn Fn(RawFd, Interest);

/// A callback invoked when a timer expires.
///
/// The returned value is the delay until the next expiry of the same
/// registration; returning `None` removes the registration. This is a
/// recurring-timer contract, not a one-shot one.
pub type TimerCallback = dyn Fn(TimerId) -> Option<Duration>;

/// Per-descriptor registration. The table is indexed by the raw fd value, so
/// a slot may well be vacant.
struct FileSlot {
    interest: Interest,
    callback: Option<Rc<FileCallback>>,
}

impl FileSlot {
    fn vacant() -> FileSlot {
        FileSlot {
            interest: Interest::NONE,
            callback: None,
        }
    }

    fn is_vacant(&self) -> bool {
        self.callback.is_none()
    }
}

struct TimerSlot {
    id: TimerId,
    deadline: Instant,
    callback: Rc<TimerCallback>,
}

/// A reactor multiplexing file readiness and timer expiry over `poll(2)`.
///
/// The reactor is handled through `Rc`: consumers that must not keep it alive
/// (such as a [`Dispatcher`]) hold a `Weak` and upgrade it at call time.
/// Callbacks are stored as `Rc` as well, so the reactor never holds a borrow
/// of its own tables while a callback runs — callbacks are free to register
/// and deregister events, including their own.
///
/// The file table is capacity-bounded and indexed by descriptor value;
/// registering a descriptor beyond [`capacity()`] fails until the caller
/// [`resize()`]s the table.
///
/// [`Dispatcher`]: ../dispatcher/struct.Dispatcher.html
/// [`capacity()`]: #method.capacity
/// [`resize()`]: #method.resize
pub struct Reactor {
    files: RefCell<Vec<FileSlot>>,
    timers: RefCell<Vec<TimerSlot>>,
    next_timer_id: Cell<u64>,
    running: Cell<bool>,
    /// The reactor is `!Sync + !Send`.
    _marker: PhantomData<*mut ()>,
}

impl Reactor {
    /// Creates a new reactor able to track descriptors `0..capacity`.
    pub fn new(capacity: usize) -> Rc<Reactor> {
        let mut files = Vec::with_capacity(capacity);
        files.resize_with(capacity, FileSlot::vacant);
        Rc::new(Reactor {
            files: RefCell::new(files),
            timers: RefCell::new(Vec::new()),
            next_timer_id: Cell::new(0),
            running: Cell::new(false),
            _marker: PhantomData,
        })
    }

    /// The number of descriptors the file table can hold.
    pub fn capacity(&self) -> usize {
        self.files.borrow().len()
    }

    /// Grows (or shrinks) the file table to hold descriptors
    /// `0..new_capacity`.
    ///
    /// Fails with `EINVAL` if a currently registered descriptor would fall
    /// outside the new table.
    pub fn resize(&self, new_capacity: usize) -> Result<()> {
        let mut files = self.files.borrow_mut();
        let in_use = files
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.is_vacant())
            .map(|(fd, _)| fd + 1)
            .max()
            .unwrap_or(0);
        if new_capacity < in_use {
            return Err(Error::from_raw_os_error(libc::EINVAL));
        }
        files.resize_with(new_capacity, FileSlot::vacant);
        Ok(())
    }

    /// Registers `callback` to be invoked when `fd` is ready in one of the
    /// `interest` directions.
    ///
    /// The given bits are merged into any existing registration for `fd`,
    /// and `callback` replaces the previously registered one. Registering an
    /// empty mask is a no-op. Fails with `EBADF` for a negative descriptor
    /// and `ERANGE` for one beyond [`capacity()`].
    ///
    /// [`capacity()`]: #method.capacity
    pub fn register_file(
        &self,
        fd: RawFd,
        interest: Interest,
        callback: Rc<FileCallback>,
    ) -> Result<()> {
        if fd < 0 {
            return Err(Error::from_raw_os_error(libc::EBADF));
        }
        if interest.is_empty() {
            return Ok(());
        }
        let mut files = self.files.borrow_mut();
        let slot = files
            .get_mut(fd as usize)
            .ok_or_else(|| Error::from_raw_os_error(libc::ERANGE))?;
        slot.interest = slot.interest | interest;
        slot.callback = Some(callback);
        Ok(())
    }

    /// Removes the `interest` directions from the registration for `fd`.
    ///
    /// The registration (and its callback) is dropped once no directions
    /// remain. Unknown descriptors and already-clear bits are ignored.
    pub fn deregister_file(&self, fd: RawFd, interest: Interest) {
        if fd < 0 {
            return;
        }
        let mut files = self.files.borrow_mut();
        if let Some(slot) = files.get_mut(fd as usize) {
            slot.interest = slot.interest.without(interest);
            if slot.interest.is_empty() {
                slot.callback = None;
            }
        }
    }

    /// The interest mask `fd` is currently registered for.
    pub fn interest_of(&self, fd: RawFd) -> Interest {
        if fd < 0 {
            return Interest::NONE;
        }
        self.files
            .borrow()
            .get(fd as usize)
            .map(|slot| slot.interest)
            .unwrap_or(Interest::NONE)
    }

    /// Registers `callback` to be invoked once `delay` has elapsed.
    ///
    /// The callback's return value is the delay until it runs again; see
    /// [`TimerCallback`].
    ///
    /// [`TimerCallback`]: type.TimerCallback.html
    pub fn register_timer(&self, delay: Duration, callback: Rc<TimerCallback>) -> Result<TimerId> {
        let id = TimerId(self.next_timer_id.get());
        self.next_timer_id.set(id.0 + 1);
        self.timers.borrow_mut().push(TimerSlot {
            id,
            deadline: Instant::now() + delay,
            callback,
        });
        Ok(id)
    }

    /// Removes a timer registration. Returns whether it was still armed.
    pub fn deregister_timer(&self, id: TimerId) -> bool {
        let mut timers = self.timers.borrow_mut();
        match timers.iter().position(|slot| slot.id == id) {
            Some(index) => {
                timers.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// The number of currently armed timers.
    pub fn armed_timers(&self) -> usize {
        self.timers.borrow().len()
    }

    fn has_registrations(&self) -> bool {
        self.files.borrow().iter().any(|slot| !slot.is_vacant())
            || !self.timers.borrow().is_empty()
    }

    /// How long `poll(2)` may sleep: until the nearest timer deadline, or
    /// forever when no timer is armed.
    fn poll_timeout(&self, now: Instant) -> libc::c_int {
        let nearest = self.timers.borrow().iter().map(|slot| slot.deadline).min();
        match nearest {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(now);
                // Round up so we don't wake just short of the deadline and spin.
                let ms = remaining.as_millis().saturating_add(1);
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            }
            None => -1,
        }
    }

    /// Waits for the next readiness or timer event and dispatches everything
    /// that became due, returning the number of callbacks delivered.
    ///
    /// Per descriptor, the readable direction is delivered before the
    /// writable one. A descriptor in an error or hang-up condition is
    /// delivered for every direction it is registered for, so its owner gets
    /// to observe the failure from its ordinary I/O path. Before each
    /// delivery the registration is re-checked: a callback that ran earlier
    /// in the same batch may have deregistered it.
    ///
    /// Returns without dispatching anything if nothing is registered, or if
    /// the wait was interrupted by a signal.
    pub fn poll_once(&self) -> Result<usize> {
        let now = Instant::now();
        let mut pollfds: Vec<libc::pollfd> = self
            .files
            .borrow()
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.is_vacant())
            .map(|(fd, slot)| libc::pollfd {
                fd: fd as RawFd,
                events: slot.interest.as_poll_events(),
                revents: 0,
            })
            .collect();
        let timeout = self.poll_timeout(now);
        if pollfds.is_empty() && timeout < 0 {
            return Ok(0);
        }

        // SAFETY: The pointer and length describe a valid, live slice.
        let ret = cvt(unsafe {
            libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout)
        });
        match ret {
            Ok(_) => {}
            Err(ref e) if e.kind() == ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        let mut delivered = 0;
        for pollfd in &pollfds {
            if pollfd.revents == 0 {
                continue;
            }
            let hangup = pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
            for &(direction, bit) in &[
                (Interest::READ, libc::POLLIN),
                (Interest::WRITE, libc::POLLOUT),
            ] {
                if pollfd.revents & bit == 0 && !hangup {
                    continue;
                }
                delivered += self.deliver_file(pollfd.fd, direction);
            }
        }
        delivered += self.fire_due_timers();
        Ok(delivered)
    }

    /// Invokes the callback registered for `(fd, direction)`, if it is still
    /// there. No table borrow is held across the invocation.
    fn deliver_file(&self, fd: RawFd, direction: Interest) -> usize {
        let callback = {
            let files = self.files.borrow();
            match files.get(fd as usize) {
                Some(slot) if slot.interest.contains(direction) => slot.callback.clone(),
                _ => None,
            }
        };
        match callback {
            Some(callback) => {
                callback(fd, direction);
                1
            }
            None => 0,
        }
    }

    /// Fires every timer whose deadline has passed, adopting each callback's
    /// returned delay (or removing the registration on `None`).
    fn fire_due_timers(&self) -> usize {
        let now = Instant::now();
        let due: Vec<TimerId> = self
            .timers
            .borrow()
            .iter()
            .filter(|slot| slot.deadline <= now)
            .map(|slot| slot.id)
            .collect();

        let mut fired = 0;
        for id in due {
            let callback = {
                let timers = self.timers.borrow();
                timers
                    .iter()
                    .find(|slot| slot.id == id)
                    .map(|slot| slot.callback.clone())
            };
            let callback = match callback {
                Some(callback) => callback,
                // Deregistered by an earlier callback in this batch.
                None => continue,
            };
            let next_delay = callback(id);
            fired += 1;

            let mut timers = self.timers.borrow_mut();
            if let Some(index) = timers.iter().position(|slot| slot.id == id) {
                match next_delay {
                    Some(delay) => timers[index].deadline = Instant::now() + delay,
                    None => {
                        timers.swap_remove(index);
                    }
                }
            }
        }
        fired
    }

    /// Runs the dispatch loop until [`stop()`] is called or nothing is
    /// registered anymore.
    ///
    /// [`stop()`]: #method.stop
    pub fn run(&self) -> Result<()> {
        self.running.set(true);
        while self.running.get() && self.has_registrations() {
            self.poll_once()?;
        }
        self.running.set(false);
        Ok(())
    }

    /// Requests that [`run()`] return after the current dispatch round.
    ///
    /// [`run()`]: #method.run
    pub fn stop(&self) {
        self.running.set(false);
    }
}
