//! Binding one socket's lifecycle to a reactor.

use std::{
    cell::{Cell, RefCell},
    io::{Error, ErrorKind, Result},
    net::SocketAddr,
    os::unix::io::RawFd,
    rc::{Rc, Weak},
    time::Duration,
};

use crate::{
    net,
    reactor::{FileCallback, Interest, Reactor, TimerCallback, TimerId},
};

/// Where a dispatcher's connection currently stands.
///
/// Transitions are one-directional: `Closed` resolves to `Connected` once the
/// socket's peer can be identified (the deferred connection check),
/// `Connecting` resolves to `Connected` on the first writable event, and
/// `Listening` never transitions at all.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    /// The socket is not known to be connected (yet).
    Closed,
    /// The socket is accepting incoming connections.
    Listening,
    /// A non-blocking connect is in flight.
    Connecting,
    /// The socket is connected to a peer.
    Connected,
}

type IoHandler = Box<dyn FnMut(RawFd)>;
type Gate = Box<dyn FnMut() -> bool>;
type TimeoutHandler = Box<dyn FnMut(RawFd, Duration) -> Option<Duration>>;

/// The assignable handler slots.
///
/// Each slot lives in its own `RefCell`, and an invocation takes the closure
/// out of the slot for the duration of the call. A handler is therefore free
/// to re-enter the dispatcher — change the mask, rearm the timeout, replace
/// handlers, or release the dispatcher itself.
#[derive(Default)]
struct Handlers {
    readable_if: RefCell<Option<Gate>>,
    writable_if: RefCell<Option<Gate>>,
    read: RefCell<Option<IoHandler>>,
    write: RefCell<Option<IoHandler>>,
    accepted: RefCell<Option<IoHandler>>,
    connected: RefCell<Option<IoHandler>>,
    timed_out: RefCell<Option<TimeoutHandler>>,
    closed: RefCell<Option<IoHandler>>,
}

/// Calls the handler in `slot`, if any, restoring it afterwards unless the
/// handler installed a replacement. Returns whether a handler was there.
fn invoke(slot: &RefCell<Option<IoHandler>>, fd: RawFd) -> bool {
    let handler = slot.borrow_mut().take();
    match handler {
        Some(mut handler) => {
            handler(fd);
            let mut slot = slot.borrow_mut();
            if slot.is_none() {
                *slot = Some(handler);
            }
            true
        }
        None => false,
    }
}

/// An absent gate always allows.
fn gate_allows(slot: &RefCell<Option<Gate>>) -> bool {
    let gate = slot.borrow_mut().take();
    match gate {
        Some(mut gate) => {
            let allowed = gate();
            let mut slot = slot.borrow_mut();
            if slot.is_none() {
                *slot = Some(gate);
            }
            allowed
        }
        None => true,
    }
}

/// A socket bound to a [`Reactor`].
///
/// A `Dispatcher` owns one descriptor, keeps track of its connection state,
/// and routes the reactor's readiness and timer events into user-supplied
/// handlers. It is always handled as `Rc<Dispatcher>`: the reactor itself
/// only ever holds weak references (captured inside the registered
/// callbacks), so a registration never keeps a dispatcher alive. When the
/// last `Rc` is released the dispatcher deregisters itself, closes its
/// descriptor, and fires the `on_closed` handler — exactly once.
///
/// Symmetrically, the dispatcher holds only a `Weak` reference to the
/// reactor; mutating operations fail cleanly if the reactor is gone, and
/// teardown degrades to just closing the descriptor.
///
/// All handlers run synchronously on the reactor's dispatch thread and must
/// not block — a blocking handler stalls the whole loop.
///
/// [`Reactor`]: ../reactor/struct.Reactor.html
pub struct Dispatcher {
    reactor: Weak<Reactor>,
    /// Our own weak handle, set up at construction; this is what gets
    /// captured into every closure the reactor stores.
    weak_self: Weak<Dispatcher>,
    fd: RawFd,
    state: Cell<State>,
    interest: Cell<Interest>,
    timer: Cell<Option<TimerId>>,
    timeout: Cell<Option<Duration>>,
    handlers: Handlers,
}

fn reactor_gone() -> Error {
    Error::new(ErrorKind::Other, "the reactor is gone")
}

impl Dispatcher {
    fn build(
        reactor: &Rc<Reactor>,
        fd: RawFd,
        state: State,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> Rc<Dispatcher> {
        Rc::new_cyclic(|weak| Dispatcher {
            reactor: Rc::downgrade(reactor),
            weak_self: weak.clone(),
            fd,
            state: Cell::new(state),
            interest: Cell::new(interest),
            timer: Cell::new(None),
            timeout: Cell::new(timeout),
            handlers: Handlers::default(),
        })
    }

    /// The file callback handed to the reactor. It captures only a weak
    /// reference: an event arriving after the dispatcher's owners released
    /// it is silently dropped.
    fn file_callback(&self) -> Rc<FileCallback> {
        let weak = self.weak_self.clone();
        Rc::new(move |fd, direction| {
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.dispatch(fd, direction);
            }
        })
    }

    /// Same weak-capture discipline for the timer callback; an unresolvable
    /// dispatcher tells the reactor its timer is done.
    fn timer_callback(&self) -> Rc<TimerCallback> {
        let weak = self.weak_self.clone();
        Rc::new(move |id| match weak.upgrade() {
            Some(dispatcher) => dispatcher.expire(id),
            None => None,
        })
    }

    /// The second phase of construction: the fully formed dispatcher
    /// registers itself with the reactor. On failure the factory drops the
    /// `Rc`, whose teardown deregisters whatever did get registered and
    /// closes the descriptor, so a failed factory leaks nothing and exposes
    /// nothing.
    fn attach(&self, reactor: &Rc<Reactor>) -> Result<()> {
        if self.fd as usize >= reactor.capacity() {
            reactor.resize(self.fd as usize + 1)?;
        }
        if let Some(delay) = self.timeout.get() {
            let id = reactor.register_timer(delay, self.timer_callback())?;
            self.timer.set(Some(id));
        }
        reactor.register_file(self.fd, self.interest.get(), self.file_callback())
    }

    /// Wraps an already-open descriptor.
    ///
    /// The dispatcher starts in the [`Closed`] state: the descriptor's peer
    /// is not assumed to be connected. The first readiness event probes the
    /// peer, and if the socket turns out to be connected, transitions to
    /// [`Connected`] and fires `on_connected`. This is the factory to use
    /// for descriptors handed out by `on_accepted`.
    ///
    /// Fails with `EBADF` for a negative descriptor, or if any reactor
    /// registration fails.
    ///
    /// [`Closed`]: enum.State.html#variant.Closed
    /// [`Connected`]: enum.State.html#variant.Connected
    pub fn new(
        reactor: &Rc<Reactor>,
        fd: RawFd,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> Result<Rc<Dispatcher>> {
        if fd < 0 {
            return Err(Error::from_raw_os_error(libc::EBADF));
        }
        let dispatcher = Self::build(reactor, fd, State::Closed, interest, timeout);
        dispatcher.attach(reactor)?;
        Ok(dispatcher)
    }

    /// Opens a listening socket on `addr` and wraps it.
    ///
    /// The dispatcher stays in the [`Listening`] state for its whole life,
    /// registered for readable events only. Each incoming connection is
    /// accepted and handed to `on_accepted`, which takes ownership of the
    /// new descriptor — typically to wrap it with [`new()`]. Without an
    /// `on_accepted` handler, accepted connections are closed on the spot.
    ///
    /// [`Listening`]: enum.State.html#variant.Listening
    /// [`new()`]: #method.new
    pub fn acceptor(
        reactor: &Rc<Reactor>,
        addr: SocketAddr,
        timeout: Option<Duration>,
    ) -> Result<Rc<Dispatcher>> {
        let fd = net::tcp_listener(addr)?;
        let dispatcher = Self::build(reactor, fd, State::Listening, Interest::READ, timeout);
        dispatcher.attach(reactor)?;
        Ok(dispatcher)
    }

    /// Initiates a non-blocking connect to `addr` and wraps the socket.
    ///
    /// If the connect is still in progress when the factory returns, the
    /// dispatcher is in the [`Connecting`] state and will transition to
    /// [`Connected`] (firing `on_connected`, immediately followed by
    /// `on_write` — connect completion doubles as the first write
    /// opportunity) on the first writable event. If the connect resolved
    /// synchronously the dispatcher starts [`Closed`] and the deferred
    /// connection check confirms the peer on first readiness instead.
    ///
    /// A connect that fails outright fails the factory; no dispatcher is
    /// ever handed out in `Connecting` with a dead descriptor. A connect
    /// that fails asynchronously (a refusal from a remote host, say)
    /// surfaces as an error condition on the descriptor, which the reactor
    /// delivers on every registered direction: the writable delivery still
    /// transitions to [`Connected`] and fires `on_connected`, and the
    /// failure is then observed by the first read or write — the same way a
    /// connection that died right after establishing would be. The readable
    /// delivery arrives while still [`Connecting`], which debug builds
    /// treat as a contract breach.
    ///
    /// [`Connecting`]: enum.State.html#variant.Connecting
    /// [`Connected`]: enum.State.html#variant.Connected
    /// [`Closed`]: enum.State.html#variant.Closed
    pub fn connector(
        reactor: &Rc<Reactor>,
        addr: SocketAddr,
        timeout: Option<Duration>,
    ) -> Result<Rc<Dispatcher>> {
        let (fd, in_progress) = net::tcp_connect(addr)?;
        let state = if in_progress {
            State::Connecting
        } else {
            State::Closed
        };
        let dispatcher = Self::build(reactor, fd, state, Interest::READ_WRITE, timeout);
        dispatcher.attach(reactor)?;
        Ok(dispatcher)
    }

    /// The descriptor this dispatcher owns.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The current connection state.
    pub fn state(&self) -> State {
        self.state.get()
    }

    /// The interest mask currently registered with the reactor.
    pub fn interest(&self) -> Interest {
        self.interest.get()
    }

    /// The current timeout, if one is armed.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.get()
    }

    /// Changes the registered interest mask.
    ///
    /// The new mask is registered before the stale bits of the old one are
    /// deregistered, so the descriptor is registered for a previously valid
    /// mask at every instant — there is no transient gap, and no transient
    /// empty mask unless `interest` itself is empty. A no-op if the mask is
    /// unchanged; fails without side effects if the registration fails or
    /// the reactor is gone.
    pub fn set_mask(&self, interest: Interest) -> Result<()> {
        let old = self.interest.get();
        if interest == old {
            return Ok(());
        }
        let reactor = self.reactor.upgrade().ok_or_else(reactor_gone)?;
        reactor.register_file(self.fd, interest, self.file_callback())?;
        reactor.deregister_file(self.fd, old.without(interest));
        self.interest.set(interest);
        Ok(())
    }

    /// Arms (or rearms) the timeout.
    ///
    /// The new timer is registered before the old one is torn down, so at
    /// every instant at most one timer is armed and never none. Passing
    /// `None` is a successful no-op: a running timeout is cancelled from
    /// within `on_timed_out` by returning `None` from the handler. Fails
    /// without side effects if the reactor is gone.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let reactor = self.reactor.upgrade().ok_or_else(reactor_gone)?;
        if let Some(delay) = timeout {
            let id = reactor.register_timer(delay, self.timer_callback())?;
            if let Some(old) = self.timer.get() {
                reactor.deregister_timer(old);
            }
            self.timer.set(Some(id));
            self.timeout.set(Some(delay));
        }
        Ok(())
    }

    /// Gates readable dispatch: when present and returning `false`, readable
    /// events are dropped before reaching `on_read`/`on_accepted`.
    pub fn readable_if(&self, gate: impl FnMut() -> bool + 'static) {
        *self.handlers.readable_if.borrow_mut() = Some(Box::new(gate));
    }

    /// Gates writable dispatch, like [`readable_if()`] does for reads.
    ///
    /// [`readable_if()`]: #method.readable_if
    pub fn writable_if(&self, gate: impl FnMut() -> bool + 'static) {
        *self.handlers.writable_if.borrow_mut() = Some(Box::new(gate));
    }

    /// Called when a connected socket is readable. What to read, and how, is
    /// entirely up to the handler.
    pub fn on_read(&self, handler: impl FnMut(RawFd) + 'static) {
        *self.handlers.read.borrow_mut() = Some(Box::new(handler));
    }

    /// Called when a connected socket is writable.
    pub fn on_write(&self, handler: impl FnMut(RawFd) + 'static) {
        *self.handlers.write.borrow_mut() = Some(Box::new(handler));
    }

    /// Called with each newly accepted descriptor, which the handler now
    /// owns: wrap it in a new dispatcher or close it.
    pub fn on_accepted(&self, handler: impl FnMut(RawFd) + 'static) {
        *self.handlers.accepted.borrow_mut() = Some(Box::new(handler));
    }

    /// Called once the connection is established.
    pub fn on_connected(&self, handler: impl FnMut(RawFd) + 'static) {
        *self.handlers.connected.borrow_mut() = Some(Box::new(handler));
    }

    /// Called when the timeout elapses, with the descriptor and the current
    /// timeout. The returned value becomes the new timeout — return it
    /// unchanged to keep the cadence, something else to reschedule, or
    /// `None` to cancel. Without this handler a timeout fires once and
    /// disarms itself.
    pub fn on_timed_out(
        &self,
        handler: impl FnMut(RawFd, Duration) -> Option<Duration> + 'static,
    ) {
        *self.handlers.timed_out.borrow_mut() = Some(Box::new(handler));
    }

    /// Called exactly once, from teardown, after the descriptor has been
    /// closed. It fires even when the reactor is already gone.
    pub fn on_closed(&self, handler: impl FnMut(RawFd) + 'static) {
        *self.handlers.closed.borrow_mut() = Some(Box::new(handler));
    }

    /// Routes one file event. The caller (the reactor-registered closure)
    /// has already upgraded the weak reference, so `self` stays alive for
    /// the whole delivery even if a handler releases the last owning `Rc`.
    fn dispatch(&self, fd: RawFd, direction: Interest) {
        // Deferred connection check: a socket wrapped in the `Closed` state
        // is confirmed connected the moment its peer can be identified.
        if self.state.get() == State::Closed && net::peer_identity(fd).is_ok() {
            self.state.set(State::Connected);
            invoke(&self.handlers.connected, fd);
        }

        if direction == Interest::READ {
            if !gate_allows(&self.handlers.readable_if) {
                return;
            }
            match self.state.get() {
                State::Listening => {
                    // Accept failures are transient; the listener stays up.
                    if let Ok(conn) = net::accept(fd) {
                        if !invoke(&self.handlers.accepted, conn) {
                            // Nobody took ownership.
                            // SAFETY: `conn` came straight from accept().
                            unsafe { libc::close(conn) };
                        }
                    }
                }
                State::Connected => {
                    invoke(&self.handlers.read, fd);
                }
                state => debug_assert!(false, "readable event in state {:?}", state),
            }
        } else if direction == Interest::WRITE {
            if !gate_allows(&self.handlers.writable_if) {
                return;
            }
            match self.state.get() {
                State::Connecting => {
                    self.state.set(State::Connected);
                    invoke(&self.handlers.connected, fd);
                    // Connect completion is also the first write
                    // opportunity; deliver both in this one event.
                    invoke(&self.handlers.write, fd);
                }
                State::Connected => {
                    invoke(&self.handlers.write, fd);
                }
                state => debug_assert!(false, "writable event in state {:?}", state),
            }
        }
    }

    /// Routes a timer expiry; the return value is the reactor's next delay
    /// for this registration.
    fn expire(&self, _id: TimerId) -> Option<Duration> {
        let handler = self.handlers.timed_out.borrow_mut().take();
        let next = match handler {
            Some(mut handler) => {
                let next = match self.timeout.get() {
                    Some(current) => handler(self.fd, current),
                    None => None,
                };
                let mut slot = self.handlers.timed_out.borrow_mut();
                if slot.is_none() {
                    *slot = Some(handler);
                }
                next
            }
            None => None,
        };
        self.timeout.set(next);
        if next.is_none() {
            // The reactor won't rearm a timer that returned no-more.
            self.timer.set(None);
        }
        next
    }
}

impl Drop for Dispatcher {
    /// Teardown: runs exactly once, when the last owner lets go. Ordering
    /// matters — deregister first (while the reactor, if still alive, could
    /// otherwise deliver into a half-dead dispatcher), then close, then
    /// notify.
    fn drop(&mut self) {
        if let Some(reactor) = self.reactor.upgrade() {
            if let Some(id) = self.timer.take() {
                reactor.deregister_timer(id);
            }
            reactor.deregister_file(self.fd, self.interest.get());
        }
        // SAFETY: The dispatcher owns this descriptor; nothing else closes it.
        unsafe { libc::close(self.fd) };
        if let Some(mut handler) = self.handlers.closed.borrow_mut().take() {
            handler(self.fd);
        }
    }
}
