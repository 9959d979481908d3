use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use log::info;
use socket2::{Domain, Protocol, Socket, Type};

/// TCP listener for serving captured records to an external consumer.
///
/// Configured through socket2 for the options that matter on this path:
/// `SO_REUSEADDR` so a restarted daemon rebinds immediately, `TCP_NODELAY`
/// because records are written as they arrive and must not sit in Nagle's
/// buffer. Accept is blocking; the export side has no polling loop of its
/// own.
pub struct ExportListener {
    socket: Socket,
}

impl ExportListener {
    /// Binds the export listener on all interfaces.
    ///
    /// # Errors
    /// Returns `std::io::Error` if the socket cannot be created,
    /// configured, or bound.
    pub fn bind(port: u16) -> std::io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nodelay(true)?;

        let addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port);
        socket.bind(&addr.into())?;

        // One capture consumer at a time; a deep backlog would only hide
        // misconfiguration.
        const LISTEN_BACKLOG: i32 = 8;
        socket.listen(LISTEN_BACKLOG)?;

        info!(
            "record export listening on port {} (fd: {}) [REUSEADDR=ON, NODELAY=ON]",
            port,
            socket.as_raw_fd()
        );
        Ok(Self { socket })
    }

    /// The locally bound port (useful when bound to port 0).
    pub fn local_port(&self) -> std::io::Result<u16> {
        let addr = self.socket.local_addr()?;
        Ok(addr.as_socket().map(|a| a.port()).unwrap_or(0))
    }

    /// Blocks until a consumer connects, then hands back a plain blocking
    /// stream with NODELAY set.
    pub fn accept(&self) -> std::io::Result<TcpStream> {
        let (client, peer) = self.socket.accept()?;
        client.set_nodelay(true)?;
        info!(
            "export consumer connected from {:?}",
            peer.as_socket()
        );
        Ok(client.into())
    }
}

impl AsRawFd for ExportListener {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn export_roundtrip() {
        let listener = ExportListener::bind(0).unwrap();
        let port = listener.local_port().unwrap();

        let writer = std::thread::spawn(move || {
            let mut client = listener.accept().unwrap();
            client.write_all(b"erf!").unwrap();
        });

        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"erf!");
        writer.join().unwrap();
    }
}
