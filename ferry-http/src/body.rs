//! Response body abstraction.
//!
//! A body is either fully materialised (`Bytes`) or a pull-style
//! stream that the connection writer drains chunk by chunk, which is
//! how backpressure propagates from a slow client to the upstream.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use ferry_core::FerryError;

/// A pull-style byte stream.  The owner must drive it to completion
/// (`Ok(None)`) or drop it, which counts as close.
#[async_trait(?Send)]
pub trait BodyStream {
    /// The next chunk, or `None` at end of stream.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, FerryError>;
}

pub enum ResponseBody {
    Empty,
    Bytes(Bytes),
    Stream {
        /// Declared length, when known.
        len: Option<u64>,
        stream: Box<dyn BodyStream>,
    },
}

impl ResponseBody {
    pub fn bytes(data: impl Into<Bytes>) -> Self {
        ResponseBody::Bytes(data.into())
    }

    pub fn text(data: impl Into<String>) -> Self {
        ResponseBody::Bytes(Bytes::from(data.into()))
    }

    pub fn is_empty_kind(&self) -> bool {
        matches!(self, ResponseBody::Empty)
    }

    /// Available length, if known in advance.
    pub fn len(&self) -> Option<u64> {
        match self {
            ResponseBody::Empty => Some(0),
            ResponseBody::Bytes(b) => Some(b.len() as u64),
            ResponseBody::Stream { len, .. } => *len,
        }
    }

    /// Drain the body into memory, enforcing a cap.  Used when a
    /// transformation or error document needs the whole entity.
    pub async fn collect(self, cap: usize) -> Result<Bytes, FerryError> {
        match self {
            ResponseBody::Empty => Ok(Bytes::new()),
            ResponseBody::Bytes(b) => {
                if b.len() > cap {
                    return Err(FerryError::Internal("response body too large".into()));
                }
                Ok(b)
            }
            ResponseBody::Stream { mut stream, .. } => {
                let mut out = BytesMut::new();
                while let Some(chunk) = stream.next_chunk().await? {
                    if out.len() + chunk.len() > cap {
                        return Err(FerryError::Internal("response body too large".into()));
                    }
                    out.extend_from_slice(&chunk);
                }
                Ok(out.freeze())
            }
        }
    }

    /// Drain and discard the body (HEAD responses, error paths), so
    /// upstream connections can complete and be reused.
    pub async fn discard(self) {
        if let ResponseBody::Stream { mut stream, .. } = self {
            while let Ok(Some(_)) = stream.next_chunk().await {}
        }
    }
}

impl From<Bytes> for ResponseBody {
    fn from(b: Bytes) -> Self {
        if b.is_empty() {
            ResponseBody::Empty
        } else {
            ResponseBody::Bytes(b)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticStream {
        chunks: Vec<Bytes>,
    }

    #[async_trait(?Send)]
    impl BodyStream for StaticStream {
        async fn next_chunk(&mut self) -> Result<Option<Bytes>, FerryError> {
            if self.chunks.is_empty() {
                Ok(None)
            } else {
                Ok(Some(self.chunks.remove(0)))
            }
        }
    }

    #[monoio::test]
    async fn collect_stream() {
        let body = ResponseBody::Stream {
            len: Some(11),
            stream: Box::new(StaticStream {
                chunks: vec![Bytes::from_static(b"hello "), Bytes::from_static(b"world")],
            }),
        };
        let all = body.collect(1024).await.unwrap();
        assert_eq!(&all[..], b"hello world");
    }

    #[monoio::test]
    async fn collect_enforces_cap() {
        let body = ResponseBody::Stream {
            len: None,
            stream: Box::new(StaticStream {
                chunks: vec![Bytes::from_static(b"0123456789")],
            }),
        };
        assert!(body.collect(5).await.is_err());
    }

    #[test]
    fn len_of_known_bodies() {
        assert_eq!(ResponseBody::Empty.len(), Some(0));
        assert_eq!(ResponseBody::bytes(&b"abc"[..]).len(), Some(3));
    }

    #[test]
    fn from_empty_bytes_is_empty() {
        let body: ResponseBody = Bytes::new().into();
        assert!(body.is_empty_kind());
    }
}
