//! A callback-driven socket dispatcher over a lightweight event loop.
//!
//! This crate binds individual TCP sockets to an event loop, one
//! [`Dispatcher`] per socket. A dispatcher owns its file descriptor, tracks
//! the connection's lifecycle (`Closed`, `Listening`, `Connecting`,
//! `Connected`), and calls back into your code when the socket becomes
//! readable or writable, when a timeout elapses, when a connection is
//! accepted or established, and when the dispatcher is finally torn down.
//!
//! Design goals:
//! * Single-threaded, cooperative dispatch — no locks, no atomics;
//! * Registrations never extend lifetimes: the event loop holds only weak
//!   references to dispatchers, and dispatchers hold only a weak reference
//!   to the loop. Either side may go away first, and a stale event is simply
//!   dropped;
//! * Teardown is ownership: releasing the last `Rc<Dispatcher>` deregisters
//!   the socket, closes it, and fires `on_closed`, exactly once.
//!
//! # Creating a dispatcher
//!
//! There are three factories, one per way a socket comes to exist:
//!
//! * [`Dispatcher::acceptor()`] binds a listening socket. Each incoming
//!   connection is accepted for you and passed to the `on_accepted` handler,
//!   which owns the new descriptor.
//! * [`Dispatcher::connector()`] starts a non-blocking outbound connect. Once
//!   it completes, `on_connected` fires — immediately followed by `on_write`,
//!   since connect completion is also the first opportunity to send.
//! * [`Dispatcher::new()`] wraps a descriptor you already have, typically one
//!   that `on_accepted` just handed you. Whether it is actually connected is
//!   confirmed lazily, on its first readiness event.
//!
//! A minimal echo server (see `demos/echo-server.rs` for the full version):
//!
//! ```no_run
//! use std::{cell::RefCell, collections::HashMap, rc::Rc, time::Duration};
//! use tether::{Dispatcher, Interest, Reactor};
//!
//! # fn main() -> std::io::Result<()> {
//! let reactor = Reactor::new(1024);
//! let server = Dispatcher::acceptor(&reactor, "127.0.0.1:7777".parse().unwrap(), None)?;
//!
//! let clients = Rc::new(RefCell::new(HashMap::new()));
//! server.on_accepted({
//!     let reactor = Rc::clone(&reactor);
//!     let clients = Rc::clone(&clients);
//!     move |fd| {
//!         let client = match Dispatcher::new(&reactor, fd, Interest::READ, None) {
//!             Ok(client) => client,
//!             Err(_) => return,
//!         };
//!         client.on_read({
//!             let clients = Rc::clone(&clients);
//!             move |fd| {
//!                 let mut buf = [0u8; 512];
//!                 // SAFETY: plain read(2) into a live buffer.
//!                 let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
//!                 if n <= 0 {
//!                     // EOF or error: releasing the last Rc tears the
//!                     // dispatcher down once this handler returns.
//!                     clients.borrow_mut().remove(&fd);
//!                     return;
//!                 }
//!                 // SAFETY: echoing back what we just read.
//!                 unsafe { libc::write(fd, buf.as_ptr() as *const _, n as usize) };
//!             }
//!         });
//!         clients.borrow_mut().insert(fd, client);
//!     }
//! });
//!
//! reactor.run()
//! # }
//! ```
//!
//! # Liveness and teardown
//!
//! Registering with the [`Reactor`] stores a closure that captures only a
//! `Weak<Dispatcher>`. Every event delivery starts by upgrading that weak
//! reference; if the upgrade fails — the owners released the dispatcher while
//! the event was pending — the event is silently dropped. This is the rule
//! that makes callback-based teardown safe: a registration can never call
//! into a freed object, and never keeps the object alive either.
//!
//! During a delivery the upgraded `Rc` keeps the dispatcher alive until the
//! handler returns, so a handler may release the last owning reference to its
//! own dispatcher (say, by removing it from a connection table) and finish
//! normally; teardown then runs right after. Do not touch the dispatcher
//! again from the same handler after such a release.
//!
//! # Handlers must not block
//!
//! Dispatch is single-threaded and synchronous. A handler that blocks —
//! a blocking read, a sleep, anything — stalls every other socket and timer
//! on the loop. All waiting is expressed by returning to the reactor:
//! register interest, and get called back.
//!
//! [`Dispatcher`]: dispatcher/struct.Dispatcher.html
//! [`Dispatcher::new()`]: dispatcher/struct.Dispatcher.html#method.new
//! [`Dispatcher::acceptor()`]: dispatcher/struct.Dispatcher.html#method.acceptor
//! [`Dispatcher::connector()`]: dispatcher/struct.Dispatcher.html#method.connector
//! [`Reactor`]: reactor/struct.Reactor.html

pub mod dispatcher;
pub mod net;
pub mod reactor;
mod util;

#[doc(inline)]
pub use crate::dispatcher::{Dispatcher, State};
#[doc(inline)]
pub use crate::reactor::{Interest, Reactor, TimerId};
