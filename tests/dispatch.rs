use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fs::File,
    io::{Read, Write},
    mem::ManuallyDrop,
    net::{SocketAddr, TcpListener, TcpStream, UdpSocket},
    os::unix::io::{FromRawFd, IntoRawFd, RawFd},
    rc::Rc,
    thread,
};

use tether::{net, Dispatcher, Interest, Reactor, State};

fn ephemeral() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Borrow a raw socket fd for one std I/O call without closing it.
fn read_fd(fd: RawFd, buf: &mut [u8]) -> usize {
    let mut file = ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
    file.read(buf).expect("read failed")
}

fn write_fd(fd: RawFd, buf: &[u8]) {
    let mut file = ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
    file.write_all(buf).expect("write failed");
}

#[test]
fn acceptor_echoes_ping() {
    let reactor = Reactor::new(64);
    let server = Dispatcher::acceptor(&reactor, ephemeral(), None).unwrap();
    assert_eq!(server.state(), State::Listening);
    assert_eq!(reactor.interest_of(server.fd()), Interest::READ);
    let addr = net::local_identity(server.fd()).unwrap();

    let accepted = Rc::new(Cell::new(0usize));
    let events: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    let payload: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let clients: Rc<RefCell<HashMap<RawFd, Rc<Dispatcher>>>> =
        Rc::new(RefCell::new(HashMap::new()));

    server.on_accepted({
        let reactor = Rc::clone(&reactor);
        let accepted = Rc::clone(&accepted);
        let events = Rc::clone(&events);
        let payload = Rc::clone(&payload);
        let clients = Rc::clone(&clients);
        move |fd| {
            accepted.set(accepted.get() + 1);
            let client = Dispatcher::new(&reactor, fd, Interest::READ, None).unwrap();
            assert_eq!(client.state(), State::Closed);
            client.on_connected({
                let events = Rc::clone(&events);
                move |_fd| events.borrow_mut().push("connected")
            });
            client.on_read({
                let events = Rc::clone(&events);
                let payload = Rc::clone(&payload);
                let clients = Rc::clone(&clients);
                move |fd| {
                    events.borrow_mut().push("read");
                    let mut buf = [0u8; 16];
                    let n = read_fd(fd, &mut buf);
                    if n == 0 {
                        clients.borrow_mut().remove(&fd);
                        return;
                    }
                    payload.borrow_mut().extend_from_slice(&buf[..n]);
                    write_fd(fd, &buf[..n]);
                }
            });
            clients.borrow_mut().insert(fd, client);
        }
    });

    let talker = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"ping").unwrap();
        let mut echo = [0u8; 4];
        stream.read_exact(&mut echo).unwrap();
        echo
    });

    while payload.borrow().len() < 4 {
        reactor.poll_once().unwrap();
    }

    assert_eq!(&payload.borrow()[..], b"ping");
    assert_eq!(talker.join().unwrap(), *b"ping");
    assert_eq!(accepted.get(), 1);
    // The deferred connection check resolved the accepted socket before
    // handing it its first read.
    assert_eq!(&events.borrow()[..2], ["connected", "read"]);
    // The listener itself never leaves Listening.
    assert_eq!(server.state(), State::Listening);
    let client = clients.borrow().values().next().cloned().unwrap();
    assert_eq!(client.state(), State::Connected);
}

#[test]
fn releasing_a_dispatcher_inside_its_own_handler_closes_once() {
    let reactor = Reactor::new(64);
    let server = Dispatcher::acceptor(&reactor, ephemeral(), None).unwrap();
    let addr = net::local_identity(server.fd()).unwrap();

    let closed = Rc::new(Cell::new(0usize));
    let clients: Rc<RefCell<HashMap<RawFd, Rc<Dispatcher>>>> =
        Rc::new(RefCell::new(HashMap::new()));

    server.on_accepted({
        let reactor = Rc::clone(&reactor);
        let closed = Rc::clone(&closed);
        let clients = Rc::clone(&clients);
        move |fd| {
            let client = Dispatcher::new(&reactor, fd, Interest::READ, None).unwrap();
            client.on_read({
                let clients = Rc::clone(&clients);
                move |fd| {
                    let mut buf = [0u8; 16];
                    if read_fd(fd, &mut buf) == 0 {
                        // EOF: drop the last owning reference from inside
                        // the handler of the very dispatcher being dropped.
                        clients.borrow_mut().remove(&fd);
                    }
                }
            });
            client.on_closed({
                let closed = Rc::clone(&closed);
                move |_fd| closed.set(closed.get() + 1)
            });
            clients.borrow_mut().insert(fd, client);
        }
    });

    for expected in 1..=2 {
        let stream = TcpStream::connect(addr).unwrap();
        drop(stream);
        while closed.get() < expected {
            reactor.poll_once().unwrap();
        }
        assert_eq!(closed.get(), expected);
        assert!(clients.borrow().is_empty());
    }
}

#[test]
fn connector_completes_and_writes_in_one_delivery() {
    let reactor = Reactor::new(64);
    let listener = TcpListener::bind(ephemeral()).unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = thread::spawn(move || listener.accept().map(|(stream, _)| stream));

    let connector = Dispatcher::connector(&reactor, addr, None).unwrap();
    let initial = connector.state();
    // Either the connect resolved synchronously (Closed, pending the
    // deferred check) or it is in flight.
    assert!(initial == State::Connecting || initial == State::Closed);

    let events: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    connector.on_connected({
        let events = Rc::clone(&events);
        move |_fd| events.borrow_mut().push("connected")
    });
    connector.on_write({
        let events = Rc::clone(&events);
        move |_fd| events.borrow_mut().push("write")
    });

    let peer = acceptor.join().unwrap().unwrap();

    while events.borrow().len() < 3 {
        reactor.poll_once().unwrap();
    }

    let events = events.borrow();
    // Connect completion is immediately followed by the first write
    // opportunity, in the same delivery.
    assert_eq!(&events[..2], ["connected", "write"]);
    // And it fires exactly once over the whole lifetime.
    assert_eq!(events.iter().filter(|e| **e == "connected").count(), 1);
    assert_eq!(connector.state(), State::Connected);
    drop(peer);
}

#[test]
fn connector_to_dead_port_fails_at_construction() {
    let reactor = Reactor::new(64);
    let listener = TcpListener::bind(ephemeral()).unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    // Loopback refuses synchronously, so this must surface as a factory
    // error rather than a dispatcher stuck in Connecting on a dead fd.
    assert!(Dispatcher::connector(&reactor, addr, None).is_err());
    assert_eq!(reactor.armed_timers(), 0);
}

#[test]
fn bad_descriptor_and_bad_address_fail_cleanly() {
    let reactor = Reactor::new(64);
    assert!(Dispatcher::new(&reactor, -1, Interest::READ, None).is_err());
    // Not a local address; bind must fail before anything is registered.
    let far_away: SocketAddr = "192.0.2.1:9".parse().unwrap();
    assert!(Dispatcher::acceptor(&reactor, far_away, None).is_err());
    assert_eq!(reactor.armed_timers(), 0);
}

#[test]
fn set_mask_swaps_without_dropping_the_registration() {
    let reactor = Reactor::new(64);
    let fd = UdpSocket::bind(ephemeral()).unwrap().into_raw_fd();
    let dispatcher = Dispatcher::new(&reactor, fd, Interest::READ, None).unwrap();
    assert_eq!(reactor.interest_of(fd), Interest::READ);

    dispatcher.set_mask(Interest::WRITE).unwrap();
    assert_eq!(reactor.interest_of(fd), Interest::WRITE);
    assert_eq!(dispatcher.interest(), Interest::WRITE);

    dispatcher.set_mask(Interest::READ_WRITE).unwrap();
    assert_eq!(reactor.interest_of(fd), Interest::READ_WRITE);

    // Unchanged mask is a no-op success.
    dispatcher.set_mask(Interest::READ_WRITE).unwrap();
    assert_eq!(reactor.interest_of(fd), Interest::READ_WRITE);

    // An explicitly empty mask is honored.
    dispatcher.set_mask(Interest::NONE).unwrap();
    assert_eq!(reactor.interest_of(fd), Interest::NONE);
}

#[test]
fn readable_gate_holds_events_until_it_opens() {
    let reactor = Reactor::new(64);
    let server = Dispatcher::acceptor(&reactor, ephemeral(), None).unwrap();
    let addr = net::local_identity(server.fd()).unwrap();

    let open = Rc::new(Cell::new(false));
    let checks = Rc::new(Cell::new(0usize));
    let reads = Rc::new(Cell::new(0usize));
    let clients: Rc<RefCell<HashMap<RawFd, Rc<Dispatcher>>>> =
        Rc::new(RefCell::new(HashMap::new()));

    server.on_accepted({
        let reactor = Rc::clone(&reactor);
        let open = Rc::clone(&open);
        let checks = Rc::clone(&checks);
        let reads = Rc::clone(&reads);
        let clients = Rc::clone(&clients);
        move |fd| {
            let client = Dispatcher::new(&reactor, fd, Interest::READ, None).unwrap();
            client.readable_if({
                let open = Rc::clone(&open);
                let checks = Rc::clone(&checks);
                move || {
                    checks.set(checks.get() + 1);
                    open.get()
                }
            });
            client.on_read({
                let reads = Rc::clone(&reads);
                let clients = Rc::clone(&clients);
                move |fd| {
                    reads.set(reads.get() + 1);
                    let mut buf = [0u8; 16];
                    let n = read_fd(fd, &mut buf);
                    if n == 0 {
                        clients.borrow_mut().remove(&fd);
                        return;
                    }
                    write_fd(fd, &buf[..n]);
                }
            });
            clients.borrow_mut().insert(fd, client);
        }
    });

    let talker = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"ping").unwrap();
        let mut echo = [0u8; 4];
        stream.read_exact(&mut echo).unwrap();
        echo
    });

    // The unread bytes keep the socket readable, so the closed gate gets
    // consulted on every round and drops each event short of `on_read`.
    while checks.get() < 3 {
        reactor.poll_once().unwrap();
        assert_eq!(reads.get(), 0);
    }

    open.set(true);
    while reads.get() == 0 {
        reactor.poll_once().unwrap();
    }
    // Opening the gate let the very same pending event through.
    assert_eq!(talker.join().unwrap(), *b"ping");
}

#[test]
fn writable_gate_holds_events_until_it_opens() {
    let reactor = Reactor::new(64);
    let listener = TcpListener::bind(ephemeral()).unwrap();
    let addr = listener.local_addr().unwrap();
    let stream = TcpStream::connect(addr).unwrap();
    let (peer, _) = listener.accept().unwrap();

    let dispatcher =
        Dispatcher::new(&reactor, stream.into_raw_fd(), Interest::WRITE, None).unwrap();

    let open = Rc::new(Cell::new(false));
    let checks = Rc::new(Cell::new(0usize));
    let writes = Rc::new(Cell::new(0usize));
    dispatcher.writable_if({
        let open = Rc::clone(&open);
        let checks = Rc::clone(&checks);
        move || {
            checks.set(checks.get() + 1);
            open.get()
        }
    });
    dispatcher.on_write({
        let writes = Rc::clone(&writes);
        move |_fd| writes.set(writes.get() + 1)
    });

    // An idle connected socket is writable on every round; the closed gate
    // drops each event before `on_write`.
    while checks.get() < 3 {
        reactor.poll_once().unwrap();
        assert_eq!(writes.get(), 0);
    }
    // The deferred connection check is not subject to the gate.
    assert_eq!(dispatcher.state(), State::Connected);

    open.set(true);
    while writes.get() == 0 {
        reactor.poll_once().unwrap();
    }
    drop(peer);
}

#[test]
fn teardown_deregisters_the_descriptor() {
    let reactor = Reactor::new(64);
    let fd = UdpSocket::bind(ephemeral()).unwrap().into_raw_fd();
    let dispatcher = Dispatcher::new(&reactor, fd, Interest::READ, None).unwrap();
    assert_eq!(reactor.interest_of(fd), Interest::READ);
    drop(dispatcher);
    assert_eq!(reactor.interest_of(fd), Interest::NONE);
}

#[test]
fn construction_grows_a_small_reactor() {
    let reactor = Reactor::new(1);
    let server = Dispatcher::acceptor(&reactor, ephemeral(), None).unwrap();
    assert!(reactor.capacity() > server.fd() as usize);
    assert_eq!(reactor.interest_of(server.fd()), Interest::READ);
}

#[test]
fn mutations_fail_cleanly_once_the_reactor_is_gone() {
    let reactor = Reactor::new(64);
    let fd = UdpSocket::bind(ephemeral()).unwrap().into_raw_fd();
    let dispatcher = Dispatcher::new(&reactor, fd, Interest::READ, None).unwrap();
    drop(reactor);

    assert!(dispatcher.set_mask(Interest::WRITE).is_err());
    assert!(dispatcher
        .set_timeout(Some(std::time::Duration::from_millis(10)))
        .is_err());
    // No side effects on failure.
    assert_eq!(dispatcher.interest(), Interest::READ);
    assert_eq!(dispatcher.timeout(), None);

    // Teardown still notifies, even with the reactor long gone.
    let closed = Rc::new(Cell::new(false));
    dispatcher.on_closed({
        let closed = Rc::clone(&closed);
        move |_fd| closed.set(true)
    });
    drop(dispatcher);
    assert!(closed.get());
}
