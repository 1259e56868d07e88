//! UDP socket layer: formats, sends and receives bencoded messages.

use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use tracing::{debug, trace};

use crate::messages::{Message, MessageType, RequestSpecific, ResponseSpecific};

const VERSION: [u8; 4] = [114, 100, 0, 1]; // "rd" version 01
const MTU: usize = 2048;
const UDP_SOCKET_BUFFER_SIZE: i32 = 2 * 1024 * 1024; // 2MB

pub const DEFAULT_PORT: u16 = 6881;

/// A UdpSocket wrapper that encodes and decodes router messages.
///
/// Transaction ids are owned by the search store, so this layer does no
/// request/response correlation of its own; replies to unknown ids are the
/// router's problem to drop.
#[derive(Debug)]
pub(crate) struct RpcSocket {
    socket: UdpSocket,
    local_addr: SocketAddrV4,
}

impl RpcSocket {
    pub fn new(port: Option<u16>) -> Result<Self, std::io::Error> {
        let socket = if let Some(port) = port {
            UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))?
        } else {
            match UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))) {
                Ok(socket) => Ok(socket),
                Err(_) => UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))),
            }?
        };

        // Default OS buffers (~128KB) drop packets under bursty reply
        // traffic; raise both directions.
        set_socket_buffers(&socket, UDP_SOCKET_BUFFER_SIZE)?;

        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unimplemented!("RpcSocket does not support Ipv6"),
        };

        socket.set_nonblocking(true)?;

        Ok(Self { socket, local_addr })
    }

    // === Getters ===

    /// Returns the address the socket is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    // === Public Methods ===

    /// Send a request with a caller-provided transaction id.
    pub fn request(&mut self, address: SocketAddrV4, transaction_id: u16, request: RequestSpecific) {
        let message = Message {
            transaction_id,
            version: Some(VERSION.into()),
            message_type: MessageType::Request(request),
        };

        trace!(context = "socket_message_sending", ?message);
        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending request message");
        });
    }

    /// Send a response echoing the request's transaction id.
    pub fn response(
        &mut self,
        address: SocketAddrV4,
        transaction_id: u16,
        response: ResponseSpecific,
    ) {
        let message = Message {
            transaction_id,
            version: Some(VERSION.into()),
            message_type: MessageType::Response(response),
        };

        trace!(context = "socket_message_sending", ?message);
        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending response message");
        });
    }

    /// Receives a single message on the socket.
    /// On success, returns the message and the origin.
    pub fn recv_from(&mut self) -> Option<(Message, SocketAddrV4)> {
        let mut buf = [0u8; MTU];

        match self.socket.recv_from(&mut buf) {
            Ok((amt, SocketAddr::V4(from))) => {
                let bytes = &buf[..amt];

                if from.port() == 0 {
                    trace!(
                        context = "socket_validation",
                        message = "Message from port 0"
                    );
                    return None;
                }

                match Message::from_bytes(bytes) {
                    Ok(message) => {
                        trace!(context = "socket_message_receiving", ?message, ?from);
                        return Some((message, from));
                    }
                    Err(error) => {
                        trace!(
                            context = "socket_error",
                            ?error,
                            ?from,
                            message = ?String::from_utf8_lossy(bytes),
                            "Received invalid message"
                        );
                    }
                }
            }
            Ok((_, SocketAddr::V6(_))) => {
                trace!(
                    context = "socket_validation",
                    message = "Received IPv6 packet"
                );
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_micros(100)); // yield for a bit
            }
            Err(e) => {
                trace!(
                    context = "socket_error",
                    ?e,
                    "recv_from failed unexpectedly"
                );
            }
        }

        None
    }

    // === Private Methods ===

    /// Send a raw message.
    fn send(&mut self, address: SocketAddrV4, message: Message) -> crate::Result<()> {
        self.socket.send_to(&message.to_bytes()?, address)?;
        Ok(())
    }
}

#[cfg(unix)]
fn set_socket_buffers(socket: &UdpSocket, size: i32) -> std::io::Result<()> {
    use libc::{setsockopt, SOL_SOCKET, SO_RCVBUF, SO_SNDBUF};
    use std::io::Error;

    let fd = socket.as_raw_fd();

    // The OS may clamp the size depending on sysctl limits.
    for option in [SO_RCVBUF, SO_SNDBUF] {
        let result = unsafe {
            setsockopt(
                fd,
                SOL_SOCKET,
                option,
                &size as *const _ as *const _,
                std::mem::size_of_val(&size) as u32,
            )
        };
        if result != 0 {
            return Err(Error::last_os_error());
        }
    }

    Ok(())
}

#[cfg(not(unix))]
fn set_socket_buffers(_socket: &UdpSocket, _size: i32) -> std::io::Result<()> {
    Ok(())
}
