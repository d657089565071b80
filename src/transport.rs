//! Connections to the battery.
//!
//! A [`Connector`] opens one [`Session`] per poll cycle. The session sends a request
//! frame, waits a bounded time for the reply and hands back the reply only once its
//! checksum has been verified.

use crate::protocol::{expected_reply_len, validate_frame};
use crate::{Error, Result};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

const BUFFER_SIZE: usize = 4096;

/// One open connection to the device.
pub trait Session {
    /// Sends `request` and waits up to `timeout` for a reply with a valid checksum.
    fn exchange(&mut self, request: &[u8], timeout: Duration) -> Result<Vec<u8>>;

    /// Releases the connection. Calling it again is a no-op.
    fn close(&mut self);
}

/// Opens sessions to one device.
pub trait Connector {
    type Session: Session;

    fn open(&self) -> Result<Self::Session>;
}

/// Connects to the battery over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            address: format!("{host}:{port}"),
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = timeout;
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn connect(&self) -> std::io::Result<TcpStream> {
        let mut last_error = None;
        for addr in self.address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            std::io::Error::new(ErrorKind::AddrNotAvailable, "address resolved to nothing")
        }))
    }
}

impl Connector for TcpConnector {
    type Session = TcpSession;

    fn open(&self) -> Result<TcpSession> {
        let stream = self.connect().map_err(|source| Error::ConnectFailure {
            address: self.address.clone(),
            source,
        })?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        log::debug!("Connected to {}", peer);
        Ok(TcpSession {
            stream: Some(stream),
            peer,
        })
    }
}

#[derive(Debug)]
pub struct TcpSession {
    stream: Option<TcpStream>,
    peer: SocketAddr,
}

impl TcpSession {
    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| Error::Io(std::io::Error::from(ErrorKind::NotConnected)))
    }

    // drop anything left over from an earlier exchange to avoid data collision
    fn discard_pending(&mut self) -> Result<()> {
        let stream = self.stream()?;
        stream.set_nonblocking(true)?;
        let mut buf = [0u8; BUFFER_SIZE];
        let drained = loop {
            match stream.read(&mut buf) {
                Ok(0) => break Err(Error::Io(ErrorKind::UnexpectedEof.into())),
                Ok(n) => log::trace!("Discarded {} pending bytes", n),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(err) => break Err(Error::Io(err)),
            }
        };
        stream.set_nonblocking(false)?;
        drained
    }

    fn receive_bytes(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let stream = self.stream()?;
        let mut rx_buffer = Vec::new();
        let mut chunk = [0u8; BUFFER_SIZE];
        let mut closed = false;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            stream.set_read_timeout(Some(remaining))?;
            match stream.read(&mut chunk) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => {
                    rx_buffer.extend_from_slice(&chunk[..n]);
                    match expected_reply_len(&rx_buffer) {
                        Some(len) if rx_buffer.len() >= len => break,
                        // unknown function code, take the first read as the whole reply
                        None if rx_buffer.len() >= 2 => break,
                        _ => {}
                    }
                }
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    break
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(Error::Io(err)),
            }
        }

        if rx_buffer.is_empty() && closed {
            log::warn!("{} closed the connection without replying", self.peer);
            return Err(Error::Io(ErrorKind::UnexpectedEof.into()));
        }
        if rx_buffer.is_empty() {
            log::warn!("No response from {} within {:?}", self.peer, timeout);
            return Err(Error::Timeout(timeout));
        }
        log::trace!("receive_bytes: {:02X?}", rx_buffer);
        Ok(rx_buffer)
    }
}

impl Session for TcpSession {
    fn exchange(&mut self, request: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        self.discard_pending()?;
        log::trace!("send_bytes: {:02X?}", request);
        self.stream()?.write_all(request)?;
        let rx_buffer = self.receive_bytes(timeout)?;
        validate_frame(&rx_buffer)?;
        Ok(rx_buffer)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            log::debug!("Disconnected from {}", self.peer);
        }
    }
}

impl Drop for TcpSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{append_crc, Request};
    use std::net::TcpListener;
    use std::thread;

    fn serve_once(reply: Vec<u8>) -> (TcpConnector, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut request = [0u8; 8];
            socket.read_exact(&mut request).unwrap();
            // split the reply to exercise reassembly
            let (head, tail) = reply.split_at(reply.len().min(4));
            socket.write_all(head).unwrap();
            socket.flush().unwrap();
            thread::sleep(Duration::from_millis(20));
            socket.write_all(tail).unwrap();
            thread::sleep(Duration::from_millis(200));
            request.to_vec()
        });
        (TcpConnector::new("127.0.0.1", port), handle)
    }

    #[test]
    fn exchange_reassembles_split_reply() {
        let mut reply = vec![0x01, 0x03, 0x02, 0x00, 0x2A];
        append_crc(&mut reply);
        let (connector, server) = serve_once(reply.clone());

        let mut session = connector.open().unwrap();
        let request = Request::MeasuringProgress.frame().unwrap();
        let received = session.exchange(&request, Duration::from_secs(1)).unwrap();
        assert_eq!(received, reply);
        session.close();
        session.close();
        assert_eq!(server.join().unwrap(), request);
    }

    #[test]
    fn exchange_reports_checksum_mismatch() {
        let reply = vec![0x01, 0x03, 0x02, 0x00, 0x2A, 0x00, 0x00];
        let (connector, server) = serve_once(reply);

        let mut session = connector.open().unwrap();
        let request = Request::MeasuringProgress.frame().unwrap();
        let result = session.exchange(&request, Duration::from_secs(1));
        assert!(matches!(result, Err(Error::ChecksumMismatch { .. })));
        server.join().unwrap();
    }

    #[test]
    fn exchange_reports_exception_reply() {
        let mut reply = vec![0x01, 0x83, 0x02];
        append_crc(&mut reply);
        let (connector, server) = serve_once(reply);

        let mut session = connector.open().unwrap();
        let request = Request::Identity.frame().unwrap();
        let result = session.exchange(&request, Duration::from_secs(1));
        assert!(matches!(
            result,
            Err(Error::Exception {
                function: 0x03,
                code: 0x02
            })
        ));
        server.join().unwrap();
    }

    #[test]
    fn exchange_reports_peer_hangup() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut request = [0u8; 8];
            socket.read_exact(&mut request).unwrap();
            drop(socket);
        });

        let mut session = TcpConnector::new("127.0.0.1", port).open().unwrap();
        let request = Request::Identity.frame().unwrap();
        let result = session.exchange(&request, Duration::from_secs(1));
        match result {
            Err(Error::Io(err)) => assert_eq!(err.kind(), ErrorKind::UnexpectedEof),
            other => panic!("unexpected result {other:?}"),
        }
        server.join().unwrap();
    }

    #[test]
    fn exchange_times_out_without_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(300));
            drop(socket);
        });

        let mut session = TcpConnector::new("127.0.0.1", port).open().unwrap();
        let request = Request::Identity.frame().unwrap();
        let result = session.exchange(&request, Duration::from_millis(100));
        assert!(matches!(result, Err(Error::Timeout(_))));
        server.join().unwrap();
    }

    #[test]
    fn closed_session_refuses_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut session = TcpConnector::new("127.0.0.1", port).open().unwrap();
        session.close();
        let result = session.exchange(&[0x01], Duration::from_millis(10));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn connect_failure_is_typed() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = TcpConnector::new("127.0.0.1", port).open();
        assert!(matches!(result, Err(Error::ConnectFailure { .. })));
    }
}
