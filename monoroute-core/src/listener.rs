//! Accept-side transport: a TCP or Unix listener behind one enum, so a
//! worker's accept loop does not care which transport the process was
//! configured with.

use std::io;
use std::net::{IpAddr, SocketAddr};

use monoio::net::{ListenerOpts, TcpListener, TcpStream};
use service_async::MakeService;

/// Deferred listener construction: workers each call [`ListenerBuilder::build`]
/// on their own thread so the accepting socket lives on that thread's
/// driver. TCP binds per build (with `SO_REUSEPORT` the kernel spreads
/// accepts across workers); a Unix socket is bound once up front and the
/// fd is duplicated per build, since rebinding the same path would steal
/// the socket from earlier workers.
pub enum ListenerBuilder {
    Tcp(SocketAddr, ListenerOpts),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixListener),
}

impl ListenerBuilder {
    pub fn bind_tcp(addr: SocketAddr, opts: ListenerOpts) -> ListenerBuilder {
        Self::Tcp(addr, opts)
    }

    #[cfg(unix)]
    pub fn bind_unix<P: AsRef<std::path::Path>>(path: P) -> io::Result<ListenerBuilder> {
        // A previous run may have left the socket file behind.
        let _ = std::fs::remove_file(path.as_ref());
        let listener = std::os::unix::net::UnixListener::bind(path)?;
        if monoio::utils::is_legacy() {
            listener.set_nonblocking(true)?;
        }
        Ok(Self::Unix(listener))
    }

    pub fn build(&self) -> io::Result<Listener> {
        match self {
            ListenerBuilder::Tcp(addr, opts) => {
                TcpListener::bind_with_config(addr, opts).map(Listener::Tcp)
            }
            #[cfg(unix)]
            ListenerBuilder::Unix(listener) => {
                let dup = listener.try_clone()?;
                monoio::net::UnixListener::from_std(dup).map(Listener::Unix)
            }
        }
    }
}

impl MakeService for ListenerBuilder {
    type Service = Listener;
    type Error = io::Error;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        self.build()
    }
}

pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(monoio::net::UnixListener),
}

impl Listener {
    /// Accept one connection, yielding the stream and the peer IP where
    /// the transport has one (Unix sockets do not).
    pub async fn accept(&self) -> io::Result<(Conn, Option<IpAddr>)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((Conn::Tcp(stream), Some(addr.ip())))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Conn::Unix(stream), None))
            }
        }
    }
}

/// An accepted connection. Callers match on the variant and run their
/// (transport-generic) connection loop against the concrete stream,
/// rather than this enum re-implementing the owned-buffer I/O traits by
/// delegation.
pub enum Conn {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(monoio::net::UnixStream),
}
