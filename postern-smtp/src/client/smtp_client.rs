//! Plain TCP SMTP client transport.

use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use postern_common::{incoming, outgoing};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpSocket, TcpStream},
};

use super::{
    error::{ClientError, Result},
    response::Response,
};

/// Initial size of the read buffer for SMTP responses.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of the read buffer to prevent unbounded growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// How a message body is put on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransferEncoding {
    /// Only 7-bit ASCII; anything else is replaced with `?`.
    #[default]
    SevenBit,
    /// Bytes pass through untouched, after the peer advertised `8BITMIME`.
    EightBit,
}

/// Frame a message body for the DATA phase: line endings become CRLF,
/// lines starting with `.` are dot-stuffed, the body is terminated with
/// `CRLF.CRLF`. In [`TransferEncoding::SevenBit`] non-ASCII bytes are
/// replaced with `?`.
#[must_use]
pub fn encode_body(body: &[u8], encoding: TransferEncoding) -> Vec<u8> {
    let mut framed = Vec::with_capacity(body.len() + body.len() / 64 + 5);
    let mut at_line_start = true;
    let mut previous = 0u8;

    for &byte in body {
        match byte {
            b'\n' => {
                if previous != b'\r' {
                    framed.push(b'\r');
                }
                framed.push(b'\n');
                at_line_start = true;
            }
            _ => {
                if previous == b'\r' && !framed.ends_with(b"\n") {
                    // Bare CR, close it off as a line
                    framed.push(b'\n');
                    at_line_start = true;
                }
                if at_line_start && byte == b'.' {
                    framed.push(b'.');
                }
                if byte != b'\r' {
                    at_line_start = false;
                }
                framed.push(match encoding {
                    TransferEncoding::SevenBit if !byte.is_ascii() => b'?',
                    _ => byte,
                });
            }
        }
        previous = byte;
    }

    if !framed.is_empty() && !framed.ends_with(b"\r\n") {
        if framed.ends_with(b"\r") {
            framed.push(b'\n');
        } else {
            framed.extend_from_slice(b"\r\n");
        }
    }
    framed.extend_from_slice(b".\r\n");
    framed
}

/// An SMTP client for sending commands and receiving responses.
#[derive(Debug)]
pub struct SmtpClient {
    stream: Option<TcpStream>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    peer: SocketAddr,
    command_timeout: Duration,
}

impl SmtpClient {
    /// Opens a TCP connection to `peer`, optionally binding the local end to
    /// `local` first so the connection leaves from a specific sending IP.
    ///
    /// # Errors
    ///
    /// Returns an error if binding or connecting fails, or the connect does
    /// not complete within `connect_timeout`.
    pub async fn connect(
        peer: SocketAddr,
        local: Option<IpAddr>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let socket = if peer.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        if let Some(local) = local
            && !local.is_unspecified()
        {
            socket.bind(SocketAddr::new(local, 0))?;
        }

        let stream = tokio::time::timeout(connect_timeout, socket.connect(peer))
            .await
            .map_err(|_| ClientError::Timeout(connect_timeout))??;

        Ok(Self {
            stream: Some(stream),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            peer,
            command_timeout: Duration::from_secs(30),
        })
    }

    /// Sets how long to wait for each reply.
    #[must_use]
    pub const fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Reads the initial server greeting.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the greeting is malformed.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response(self.command_timeout).await
    }

    /// Sends a command line, appending CRLF.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the write fails.
    pub async fn send_command(&mut self, command: &str) -> Result<()> {
        outgoing!("{command}");
        let data = format!("{command}\r\n");
        self.write(data.as_bytes()).await
    }

    /// Sends a command and reads the response.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.send_command(command).await?;
        self.read_response(self.command_timeout).await
    }

    /// # Errors
    ///
    /// Returns an error if the command cannot be exchanged.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("EHLO {domain}")).await
    }

    /// # Errors
    ///
    /// Returns an error if the command cannot be exchanged.
    pub async fn helo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("HELO {domain}")).await
    }

    /// Sends `MAIL FROM`, where `None` is the null reverse-path, followed by
    /// any ESMTP parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be exchanged.
    pub async fn mail_from(&mut self, from: Option<&str>, params: &[&str]) -> Result<Response> {
        let mut cmd = format!("MAIL FROM:<{}>", from.unwrap_or_default());
        for param in params {
            cmd.push(' ');
            cmd.push_str(param);
        }
        self.command(&cmd).await
    }

    /// # Errors
    ///
    /// Returns an error if the command cannot be exchanged.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    /// # Errors
    ///
    /// Returns an error if the command cannot be exchanged.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Sends the message body framed by [`encode_body`] and reads the final
    /// reply, waiting up to `timeout` for it.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn send_data(
        &mut self,
        body: &[u8],
        encoding: TransferEncoding,
        timeout: Duration,
    ) -> Result<Response> {
        let framed = encode_body(body, encoding);
        outgoing!("<{} bytes of message data>", framed.len());
        self.write(&framed).await?;
        self.read_response(timeout).await
    }

    /// # Errors
    ///
    /// Returns an error if the command cannot be exchanged.
    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await
    }

    /// # Errors
    ///
    /// Returns an error if the command cannot be exchanged.
    pub async fn noop(&mut self) -> Result<Response> {
        self.command("NOOP").await
    }

    /// Sends `QUIT` and closes the transport without waiting for the reply.
    /// Safe to call on a closed client.
    pub async fn quit(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            outgoing!("QUIT");
            let _ = tokio::time::timeout(self.command_timeout, async {
                let _ = stream.write_all(b"QUIT\r\n").await;
                let _ = stream.shutdown().await;
            })
            .await;
        }
        self.buffer_pos = 0;
    }

    /// Drops the transport without saying goodbye.
    pub fn abort(&mut self) {
        self.stream = None;
        self.buffer_pos = 0;
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(ClientError::ConnectionClosed)?;

        match tokio::time::timeout(self.command_timeout, stream.write_all(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.abort();
                Err(err.into())
            }
            Err(_) => {
                self.abort();
                Err(ClientError::Timeout(self.command_timeout))
            }
        }
    }

    /// Reads a complete SMTP response from the server.
    async fn read_response(&mut self, timeout: Duration) -> Result<Response> {
        match tokio::time::timeout(timeout, self.read_response_inner()).await {
            Ok(Ok(response)) => {
                incoming!("{response}");
                Ok(response)
            }
            Ok(Err(err)) => {
                self.abort();
                Err(err)
            }
            Err(_) => {
                self.abort();
                Err(ClientError::Timeout(timeout))
            }
        }
    }

    async fn read_response_inner(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let stream = self.stream.as_mut().ok_or(ClientError::ConnectionClosed)?;
            let n = stream.read(&mut self.buffer[self.buffer_pos..]).await?;
            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            self.buffer_pos += n;
        }
    }
}
