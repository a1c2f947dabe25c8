//! Header-obfuscated listener and connection
//!
//! Clients may prefix each logical message with a 4-byte disguise header
//! `{verb, len_hi, len_lo, checksum}` followed by `len` masked payload bytes.
//! The wrapper restores the literal method prefix for the verb and unmasks the
//! payload. Anything that does not look like a valid header is replayed
//! verbatim and the connection becomes a plain pass-through.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::debug;

pub const HEADER_LEN: usize = 4;

/// Largest payload a single header can announce
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Verb codes carried in the first header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Post,
    Connect,
    Put,
    Head,
    Trace,
    Delete,
    /// Payload is raw bytes with no method prefix.
    Binary,
}

impl Verb {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0xCD => Some(Self::Get),
            0xDC => Some(Self::Post),
            0x00 => Some(Self::Connect),
            0xF0 => Some(Self::Put),
            0xF1 => Some(Self::Head),
            0xF2 => Some(Self::Trace),
            0xF3 => Some(Self::Delete),
            0xFF => Some(Self::Binary),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Get => 0xCD,
            Self::Post => 0xDC,
            Self::Connect => 0x00,
            Self::Put => 0xF0,
            Self::Head => 0xF1,
            Self::Trace => 0xF2,
            Self::Delete => 0xF3,
            Self::Binary => 0xFF,
        }
    }

    /// Literal bytes substituted for the header
    pub fn prefix(self) -> &'static [u8] {
        match self {
            Self::Get => b"GET ",
            Self::Post => b"POST",
            Self::Connect => b"CONN",
            Self::Put => b"PUT ",
            Self::Head => b"HEAD",
            Self::Trace => b"TRAC",
            Self::Delete => b"DELE",
            Self::Binary => b"",
        }
    }

    /// Payload bytes are XORed with this mask
    pub fn mask(self) -> u8 {
        self.code() | 0x80
    }
}

fn checksum(verb: u8, len_hi: u8, len_lo: u8) -> u8 {
    verb ^ len_hi.wrapping_add(len_lo)
}

/// Parse a complete header, returning the verb and payload length
pub fn parse_header(header: [u8; HEADER_LEN]) -> Option<(Verb, usize)> {
    let verb = Verb::from_code(header[0])?;
    if header[3] != checksum(header[0], header[1], header[2]) {
        return None;
    }
    Some((verb, u16::from_be_bytes([header[1], header[2]]) as usize))
}

/// Build a header plus masked payload for `verb`
///
/// Returns `None` when the payload does not fit in one frame.
pub fn encode_frame(verb: Verb, payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return None;
    }

    let [hi, lo] = (payload.len() as u16).to_be_bytes();
    let mask = verb.mask();

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&[verb.code(), hi, lo, checksum(verb.code(), hi, lo)]);
    frame.extend(payload.iter().map(|b| b ^ mask));
    Some(frame)
}

#[derive(Debug)]
enum DecodeState {
    Header { buf: [u8; HEADER_LEN], filled: usize },
    Payload { remaining: usize, mask: u8 },
    Passthrough,
}

pin_project! {
    /// An accepted connection that decodes obfuscated inbound traffic
    ///
    /// Writes are forwarded untouched.
    pub struct ObfuscatedStream<S> {
        #[pin]
        inner: S,
        state: DecodeState,
        queued: Vec<u8>,
        queued_pos: usize,
    }
}

impl<S> ObfuscatedStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            state: DecodeState::Header {
                buf: [0u8; HEADER_LEN],
                filled: 0,
            },
            queued: Vec::new(),
            queued_pos: 0,
        }
    }

    /// True once the connection stopped looking for headers
    pub fn is_passthrough(&self) -> bool {
        matches!(self.state, DecodeState::Passthrough)
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead> AsyncRead for ObfuscatedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();

        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if *this.queued_pos < this.queued.len() {
                let queued = &this.queued[*this.queued_pos..];
                let n = queued.len().min(buf.remaining());
                buf.put_slice(&queued[..n]);
                *this.queued_pos += n;
                if *this.queued_pos == this.queued.len() {
                    this.queued.clear();
                    *this.queued_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            match this.state {
                DecodeState::Passthrough => return this.inner.poll_read(cx, buf),

                DecodeState::Payload { remaining, mask } => {
                    if *remaining == 0 {
                        *this.state = DecodeState::Header {
                            buf: [0u8; HEADER_LEN],
                            filled: 0,
                        };
                        continue;
                    }

                    let limit = (*remaining).min(buf.remaining());
                    let mut chunk = ReadBuf::new(buf.initialize_unfilled_to(limit));
                    ready!(this.inner.as_mut().poll_read(cx, &mut chunk))?;
                    let n = chunk.filled().len();
                    for byte in chunk.filled_mut() {
                        *byte ^= *mask;
                    }
                    buf.advance(n);

                    // A short payload at EOF ends the stream like a clean close.
                    *remaining -= n;
                    return Poll::Ready(Ok(()));
                }

                DecodeState::Header { buf: header, filled } => {
                    let want = if *filled == 0 { 1 } else { HEADER_LEN };
                    let mut head = ReadBuf::new(&mut header[*filled..want]);
                    ready!(this.inner.as_mut().poll_read(cx, &mut head))?;
                    let n = head.filled().len();

                    if n == 0 {
                        if *filled == 0 {
                            return Poll::Ready(Ok(()));
                        }
                        // EOF inside a header: hand back what arrived, then EOF.
                        this.queued.extend_from_slice(&header[..*filled]);
                        *this.state = DecodeState::Passthrough;
                        continue;
                    }
                    *filled += n;

                    if *filled == 1 && Verb::from_code(header[0]).is_none() {
                        this.queued.push(header[0]);
                        *this.state = DecodeState::Passthrough;
                        continue;
                    }
                    if *filled < HEADER_LEN {
                        continue;
                    }

                    match parse_header(*header) {
                        Some((verb, len)) => {
                            this.queued.extend_from_slice(verb.prefix());
                            *this.state = DecodeState::Payload {
                                remaining: len,
                                mask: verb.mask(),
                            };
                        }
                        None => {
                            debug!(header = ?header, "Obfuscation header check failed, passing through");
                            this.queued.extend_from_slice(&header[..]);
                            *this.state = DecodeState::Passthrough;
                        }
                    }
                }
            }
        }
    }
}

impl<S: AsyncWrite> AsyncWrite for ObfuscatedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// TCP listener whose accepted connections decode obfuscation headers
pub struct ObfuscatedListener {
    listener: TcpListener,
}

impl ObfuscatedListener {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
        })
    }

    pub fn from_listener(listener: TcpListener) -> Self {
        Self { listener }
    }

    pub async fn accept(&self) -> io::Result<(ObfuscatedStream<TcpStream>, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        Ok((ObfuscatedStream::new(stream), addr))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}
