//! Streaming blob bodies and optional verification of their digest
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::{BoxStream, Stream, StreamExt, TryStreamExt};

use crate::digest::{DigestError, Digester};

/// A boxed stream of body chunks
pub type ByteStream = BoxStream<'static, Result<Bytes, io::Error>>;

/// The body of the terminal hop of a blob request, consumed lazily.
///
/// The stream cannot be rewound; issue a new request to read the blob again.
/// Dropping it before the end aborts the underlying connection. Transport
/// failures, and a body that ends before the declared `Content-Length`, are
/// reported as a final `Err` item rather than a silent end of stream.
pub struct BlobStream {
    inner: ByteStream,
    content_length: Option<u64>,
    received: u64,
    done: bool,
}

impl BlobStream {
    pub(crate) fn from_response(response: reqwest::Response, content_length: Option<u64>) -> Self {
        let inner = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            .boxed();
        Self::new(inner, content_length)
    }

    pub(crate) fn new(inner: ByteStream, content_length: Option<u64>) -> Self {
        Self {
            inner,
            content_length,
            received: 0,
            done: false,
        }
    }

    /// Length the registry declared for the body, if it sent `Content-Length`
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Number of bytes yielded so far
    pub fn bytes_received(&self) -> u64 {
        self.received
    }

    /// Wrap the stream so that it fails at the end if the received bytes do
    /// not hash to `digest`.
    pub fn verifying(self, digest: &str) -> Result<VerifyingStream, DigestError> {
        Ok(VerifyingStream {
            digester: Digester::new(digest)?,
            expected_digest: digest.to_string(),
            stream: self,
            done: false,
        })
    }

    fn finish(&mut self, item: Option<io::Result<Bytes>>) -> Poll<Option<io::Result<Bytes>>> {
        self.done = true;
        Poll::Ready(item)
    }
}

impl Stream for BlobStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match futures_util::ready!(this.inner.as_mut().poll_next(cx)) {
            Some(Ok(bytes)) => {
                this.received += bytes.len() as u64;
                match this.content_length {
                    Some(expected) if this.received > expected => this.finish(Some(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("blob body exceeds declared length of {} bytes", expected),
                    )))),
                    _ => Poll::Ready(Some(Ok(bytes))),
                }
            }
            Some(Err(e)) => this.finish(Some(Err(e))),
            None => match this.content_length {
                Some(expected) if this.received < expected => {
                    let received = this.received;
                    this.finish(Some(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "blob body ended after {} of {} declared bytes",
                            received, expected
                        ),
                    ))))
                }
                _ => this.finish(None),
            },
        }
    }
}

/// A [`BlobStream`] that checks the digest of the bytes once the body ends.
pub struct VerifyingStream {
    stream: BlobStream,
    digester: Digester,
    expected_digest: String,
    done: bool,
}

impl VerifyingStream {
    /// Length the registry declared for the body
    pub fn content_length(&self) -> Option<u64> {
        self.stream.content_length()
    }
}

impl Stream for VerifyingStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match futures_util::ready!(Pin::new(&mut this.stream).poll_next(cx)) {
            Some(Ok(bytes)) => {
                this.digester.update(&bytes);
                Poll::Ready(Some(Ok(bytes)))
            }
            Some(Err(e)) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            None => {
                this.done = true;
                let actual = this.digester.finalize();
                if actual == this.expected_digest {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        DigestError::VerificationError {
                            expected: this.expected_digest.clone(),
                            actual,
                        },
                    ))))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sha256_digest;
    use futures_util::stream;

    fn chunks(parts: Vec<io::Result<&'static [u8]>>) -> ByteStream {
        stream::iter(parts.into_iter().map(|p| p.map(Bytes::from_static))).boxed()
    }

    async fn drain<S: Stream<Item = io::Result<Bytes>> + Unpin>(mut s: S) -> (Vec<u8>, Option<io::Error>) {
        let mut out = Vec::new();
        while let Some(item) = s.next().await {
            match item {
                Ok(bytes) => out.extend_from_slice(&bytes),
                Err(e) => return (out, Some(e)),
            }
        }
        (out, None)
    }

    #[tokio::test]
    async fn complete_body_ends_cleanly() {
        let s = BlobStream::new(chunks(vec![Ok(b"hello"), Ok(b"bytes")]), Some(10));
        let (out, err) = drain(s).await;
        assert_eq!(out, b"hellobytes");
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn short_body_is_an_error() {
        let s = BlobStream::new(chunks(vec![Ok(b"hello")]), Some(10));
        let (out, err) = drain(s).await;
        assert_eq!(out, b"hello");
        assert_eq!(err.unwrap().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn transport_error_is_terminal() {
        let s = BlobStream::new(
            chunks(vec![
                Ok(b"hel"),
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
                Ok(b"lo"),
            ]),
            None,
        );
        let (out, err) = drain(s).await;
        assert_eq!(out, b"hel");
        assert_eq!(err.unwrap().kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn verifying_stream_checks_digest() {
        let good = sha256_digest(b"hellobytes");
        let s = BlobStream::new(chunks(vec![Ok(b"hello"), Ok(b"bytes")]), None)
            .verifying(&good)
            .unwrap();
        let (out, err) = drain(s).await;
        assert_eq!(out, b"hellobytes");
        assert!(err.is_none());

        let s = BlobStream::new(chunks(vec![Ok(b"tampered")]), None)
            .verifying(&good)
            .unwrap();
        let (_, err) = drain(s).await;
        assert_eq!(err.unwrap().kind(), io::ErrorKind::InvalidData);

        assert!(BlobStream::new(chunks(vec![]), None).verifying("md5:abc").is_err());
    }
}
