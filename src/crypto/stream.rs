use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use super::{Cipher, CipherError, Direction, Keystream};

enum ReadState {
    // CFB peers send their IV before any ciphertext.
    AwaitingIv { iv: Vec<u8>, filled: usize },
    Open(Keystream),
}

enum WriteState {
    Unopened,
    Open(Keystream),
}

pin_project! {
    /// A connection whose bytes are enciphered on write and deciphered on read.
    ///
    /// The write half must be opened with [`CipherStream::open`] before use.
    /// The read half opens itself once the peer's IV has been consumed.
    pub struct CipherStream<S> {
        #[pin]
        inner: S,
        cipher: Cipher,
        read_state: ReadState,
        write_state: WriteState,
        pending: Vec<u8>,
        pending_pos: usize,
    }
}

fn cipher_io_error(err: CipherError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, err)
}

impl<S> CipherStream<S> {
    pub(crate) fn new(inner: S, cipher: Cipher) -> Self {
        let iv_len = cipher.kind().iv_len();
        Self {
            inner,
            cipher,
            read_state: ReadState::AwaitingIv {
                iv: vec![0u8; iv_len],
                filled: 0,
            },
            write_state: WriteState::Unopened,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    pub fn is_write_open(&self) -> bool {
        matches!(self.write_state, WriteState::Open(_))
    }

    pub fn is_read_open(&self) -> bool {
        matches!(self.read_state, ReadState::Open(_))
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncWrite + Unpin> CipherStream<S> {
    /// Send this side's IV and prepare the encrypting keystream
    ///
    /// Calling `open` again after it succeeded is a no-op.
    pub async fn open(&mut self) -> io::Result<()> {
        if self.is_write_open() {
            return Ok(());
        }

        let iv = self.cipher.random_iv();
        let keystream = self
            .cipher
            .keystream(&iv, Direction::Encrypt)
            .map_err(cipher_io_error)?;

        if !iv.is_empty() {
            self.inner.write_all(&iv).await?;
            self.inner.flush().await?;
        }
        self.write_state = WriteState::Open(keystream);
        Ok(())
    }
}

fn poll_drain<S: AsyncWrite>(
    mut inner: Pin<&mut S>,
    pending: &mut Vec<u8>,
    pos: &mut usize,
    cx: &mut Context<'_>,
) -> Poll<io::Result<()>> {
    while *pos < pending.len() {
        let n = ready!(inner.as_mut().poll_write(cx, &pending[*pos..]))?;
        if n == 0 {
            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
        }
        *pos += n;
    }
    pending.clear();
    *pos = 0;
    Poll::Ready(Ok(()))
}

impl<S: AsyncRead> AsyncRead for CipherStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();

        loop {
            match this.read_state {
                ReadState::AwaitingIv { iv, filled } => {
                    if *filled == iv.len() {
                        let keystream = this
                            .cipher
                            .keystream(iv, Direction::Decrypt)
                            .map_err(cipher_io_error)?;
                        *this.read_state = ReadState::Open(keystream);
                        continue;
                    }

                    let mut iv_buf = ReadBuf::new(&mut iv[*filled..]);
                    ready!(this.inner.as_mut().poll_read(cx, &mut iv_buf))?;
                    let n = iv_buf.filled().len();
                    if n == 0 {
                        if *filled == 0 {
                            return Poll::Ready(Ok(()));
                        }
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed while reading cipher IV",
                        )));
                    }
                    *filled += n;
                }
                ReadState::Open(keystream) => {
                    let before = buf.filled().len();
                    ready!(this.inner.as_mut().poll_read(cx, buf))?;
                    keystream(&mut buf.filled_mut()[before..]);
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl<S: AsyncWrite> AsyncWrite for CipherStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();

        ready!(poll_drain(
            this.inner.as_mut(),
            this.pending,
            this.pending_pos,
            cx
        ))?;

        let WriteState::Open(keystream) = this.write_state else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "cipher stream written before open",
            )));
        };

        this.pending.extend_from_slice(buf);
        keystream(this.pending.as_mut_slice());

        // The bytes are accepted once enciphered; flush drains whatever is left.
        if let Poll::Ready(Err(e)) = poll_drain(this.inner, this.pending, this.pending_pos, cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        ready!(poll_drain(
            this.inner.as_mut(),
            this.pending,
            this.pending_pos,
            cx
        ))?;
        this.inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        ready!(poll_drain(
            this.inner.as_mut(),
            this.pending,
            this.pending_pos,
            cx
        ))?;
        this.inner.poll_shutdown(cx)
    }
}
