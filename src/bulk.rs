use std::net::UdpSocket;

use crate::crypto::CryptoSession;
use crate::error::{BotError, BotResult};

/// One-way UDP uplink for audio bytes, bound to the endpoint the server
/// advertises over the control link. Datagrams are sent as-is: no framing,
/// no acknowledgement, no retry.
pub struct BulkLink {
    socket: UdpSocket,
    encrypted: bool,
    session: Option<CryptoSession>,
}

impl BulkLink {
    /// Resolve and connect the datagram socket. When the endpoint was
    /// advertised with encryption, the control link's session must already
    /// exist; datagrams share its key and IV.
    pub fn connect(
        host: &str,
        port: u16,
        encrypted: bool,
        session: Option<CryptoSession>,
    ) -> BotResult<Self> {
        if encrypted && session.is_none() {
            return Err(BotError::HandshakeFailed(
                "encrypted bulk link requires a negotiated session".into(),
            ));
        }

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect((host, port))?;

        Ok(Self {
            socket,
            encrypted,
            session,
        })
    }

    /// Send one datagram, encrypting when enabled.
    pub fn send(&self, data: &[u8]) -> BotResult<()> {
        match (self.encrypted, &self.session) {
            (true, Some(session)) => {
                self.socket.send(&session.encrypt(data))?;
            }
            _ => {
                self.socket.send(data)?;
            }
        }
        Ok(())
    }
}
