use std::{
    cell::RefCell,
    collections::HashMap,
    env,
    io::Result,
    net::SocketAddr,
    os::unix::io::RawFd,
    process::exit,
    rc::Rc,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use tether::{net, Dispatcher, Interest, Reactor};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() != 3 && args.len() != 4 {
        eprintln!("usage: {} <ip> <port> [timeout-ms]", args[0]);
        exit(1);
    }
    let addr: SocketAddr = format!("{}:{}", args[1], args[2])
        .parse()
        .expect("bad address");
    let timeout = args
        .get(3)
        .map(|ms| Duration::from_millis(ms.parse().expect("bad timeout")));

    let reactor = Reactor::new(1024);
    let server = Dispatcher::acceptor(&reactor, addr, None)?;
    eprintln!("-- listening on {}", addr);

    let clients: Rc<RefCell<HashMap<RawFd, Rc<Dispatcher>>>> =
        Rc::new(RefCell::new(HashMap::new()));

    server.on_accepted({
        let reactor = Rc::clone(&reactor);
        let clients = Rc::clone(&clients);
        move |fd| {
            match net::peer_identity(fd) {
                Ok(peer) => eprintln!("-- <{}>-[{}] incoming", fd, peer),
                Err(err) => eprintln!("-- <{}> incoming, peer unknown: {}", fd, err),
            }

            let client = match Dispatcher::new(&reactor, fd, Interest::READ, timeout) {
                Ok(client) => client,
                Err(err) => {
                    eprintln!("-- <{}> setup error: {}", fd, err);
                    return;
                }
            };

            client.on_read({
                let clients = Rc::clone(&clients);
                move |fd| {
                    let mut buf = [0u8; 4096];
                    // SAFETY: plain read(2) into a live buffer.
                    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
                    if n <= 0 {
                        if n < 0 {
                            eprintln!("-- <{}> read error", fd);
                        } else {
                            eprintln!("-- <{}> EOF", fd);
                        }
                        clients.borrow_mut().remove(&fd);
                        return;
                    }
                    // SAFETY: echoing back the bytes we just read.
                    if unsafe { libc::write(fd, buf.as_ptr() as *const _, n as usize) } < 0 {
                        eprintln!("-- <{}> write error", fd);
                        clients.borrow_mut().remove(&fd);
                    }
                }
            });

            client.on_timed_out({
                let clients = Rc::clone(&clients);
                move |fd, _timeout| {
                    eprintln!("-- <{}> i/o timed out", fd);
                    clients.borrow_mut().remove(&fd);
                    None
                }
            });

            client.on_closed(move |fd| eprintln!("-- <{}> closed", fd));

            clients.borrow_mut().insert(fd, client);
        }
    });

    let handler = on_sigint as extern "C" fn(libc::c_int);
    // SAFETY: The handler only touches an atomic flag.
    unsafe { libc::signal(libc::SIGINT, handler as libc::sighandler_t) };

    // A signal interrupts poll(2) rather than restarting it, so ^C breaks
    // out of the wait and the flag check runs.
    while !INTERRUPTED.load(Ordering::Relaxed) {
        reactor.poll_once()?;
    }
    eprintln!("-- interrupted, shutting down");
    Ok(())
}
