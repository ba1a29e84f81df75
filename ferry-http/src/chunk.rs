//! Incremental chunked transfer-coding decoder and encoder helpers.

use bytes::{BufMut, Bytes, BytesMut};

/// Outcome of feeding bytes into the decoder.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkEvent {
    /// Decoded payload bytes.
    Data(Bytes),
    /// The terminating zero-size chunk (and trailer) was consumed.
    End,
    /// More input is needed.
    NeedMore,
    /// The input is not valid chunked coding.
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    Trailer,
    TrailerLine,
    Done,
}

/// A push-style dechunker: feed raw bytes, receive payload slices.
/// Keeps no payload copies; `Data` events borrow from the input via
/// `Bytes` slicing.
pub struct ChunkedDecoder {
    state: State,
    remaining: u64,
    size_accum: u64,
    size_digits: u8,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        ChunkedDecoder {
            state: State::Size,
            remaining: 0,
            size_accum: 0,
            size_digits: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Consume input from `input` (advancing it) and return the next
    /// event.  Call repeatedly until `NeedMore` or `End`.
    pub fn feed(&mut self, input: &mut Bytes) -> ChunkEvent {
        while !input.is_empty() {
            match self.state {
                State::Size => {
                    let b = input[0];
                    match b {
                        b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                            let digit = match b {
                                b'0'..=b'9' => b - b'0',
                                b'a'..=b'f' => b - b'a' + 10,
                                _ => b - b'A' + 10,
                            };
                            if self.size_digits >= 16 {
                                return ChunkEvent::Malformed;
                            }
                            self.size_accum = (self.size_accum << 4) | digit as u64;
                            self.size_digits += 1;
                            let _ = input.split_to(1);
                        }
                        b'\r' => {
                            if self.size_digits == 0 {
                                return ChunkEvent::Malformed;
                            }
                            self.state = State::SizeLf;
                            let _ = input.split_to(1);
                        }
                        b'\n' => {
                            if self.size_digits == 0 {
                                return ChunkEvent::Malformed;
                            }
                            let _ = input.split_to(1);
                            self.begin_chunk();
                        }
                        // chunk extensions: skip to end of line
                        b';' => {
                            if self.size_digits == 0 {
                                return ChunkEvent::Malformed;
                            }
                            self.state = State::SizeLf;
                            let _ = input.split_to(1);
                        }
                        _ => return ChunkEvent::Malformed,
                    }
                }
                State::SizeLf => {
                    // skip CR and chunk-extension bytes until LF
                    let b = input[0];
                    let _ = input.split_to(1);
                    if b == b'\n' {
                        self.begin_chunk();
                    }
                }
                State::Data => {
                    let take = (input.len() as u64).min(self.remaining) as usize;
                    let data = input.split_to(take);
                    self.remaining -= take as u64;
                    if self.remaining == 0 {
                        self.state = State::DataCr;
                    }
                    return ChunkEvent::Data(data);
                }
                State::DataCr => {
                    let b = input[0];
                    let _ = input.split_to(1);
                    if b == b'\r' {
                        self.state = State::DataLf;
                    } else if b == b'\n' {
                        self.state = State::Size;
                    } else {
                        return ChunkEvent::Malformed;
                    }
                }
                State::DataLf => {
                    let b = input[0];
                    let _ = input.split_to(1);
                    if b != b'\n' {
                        return ChunkEvent::Malformed;
                    }
                    self.state = State::Size;
                }
                State::Trailer => {
                    let b = input[0];
                    let _ = input.split_to(1);
                    if b == b'\n' {
                        self.state = State::Done;
                        return ChunkEvent::End;
                    } else if b != b'\r' {
                        self.state = State::TrailerLine;
                    }
                }
                State::TrailerLine => {
                    let b = input[0];
                    let _ = input.split_to(1);
                    if b == b'\n' {
                        self.state = State::Trailer;
                    }
                }
                State::Done => return ChunkEvent::End,
            }
        }
        if self.state == State::Done {
            ChunkEvent::End
        } else {
            ChunkEvent::NeedMore
        }
    }

    fn begin_chunk(&mut self) {
        let size = self.size_accum;
        self.size_accum = 0;
        self.size_digits = 0;
        if size == 0 {
            self.state = State::Trailer;
        } else {
            self.remaining = size;
            self.state = State::Data;
        }
    }
}

/// Encode one payload chunk.
pub fn encode_chunk(payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + 18);
    out.put_slice(format!("{:x}\r\n", payload.len()).as_bytes());
    out.put_slice(payload);
    out.put_slice(b"\r\n");
    out.freeze()
}

/// The terminating chunk.
pub fn final_chunk() -> Bytes {
    Bytes::from_static(b"0\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> (Vec<u8>, bool) {
        let mut decoder = ChunkedDecoder::new();
        let mut buf = Bytes::copy_from_slice(input);
        let mut out = Vec::new();
        loop {
            match decoder.feed(&mut buf) {
                ChunkEvent::Data(d) => out.extend_from_slice(&d),
                ChunkEvent::End => return (out, true),
                ChunkEvent::NeedMore => return (out, false),
                ChunkEvent::Malformed => panic!("malformed"),
            }
        }
    }

    #[test]
    fn decode_simple() {
        let (out, done) = decode_all(b"5\r\nhello\r\n0\r\n\r\n");
        assert_eq!(out, b"hello");
        assert!(done);
    }

    #[test]
    fn decode_multiple_chunks() {
        let (out, done) = decode_all(b"3\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\n");
        assert_eq!(out, b"foobar");
        assert!(done);
    }

    #[test]
    fn decode_hex_sizes() {
        let payload = vec![b'x'; 0x1a];
        let mut input = b"1a\r\n".to_vec();
        input.extend_from_slice(&payload);
        input.extend_from_slice(b"\r\n0\r\n\r\n");
        let (out, done) = decode_all(&input);
        assert_eq!(out, payload);
        assert!(done);
    }

    #[test]
    fn decode_incremental() {
        let mut decoder = ChunkedDecoder::new();
        let full = b"5\r\nhello\r\n0\r\n\r\n";
        let mut out = Vec::new();
        let mut done = false;
        for b in full.iter() {
            let mut chunk = Bytes::copy_from_slice(&[*b]);
            loop {
                match decoder.feed(&mut chunk) {
                    ChunkEvent::Data(d) => out.extend_from_slice(&d),
                    ChunkEvent::End => {
                        done = true;
                        break;
                    }
                    ChunkEvent::NeedMore => break,
                    ChunkEvent::Malformed => panic!("malformed"),
                }
            }
        }
        assert_eq!(out, b"hello");
        assert!(done);
    }

    #[test]
    fn decode_with_trailer() {
        let (out, done) = decode_all(b"3\r\nfoo\r\n0\r\nx-check: 1\r\n\r\n");
        assert_eq!(out, b"foo");
        assert!(done);
    }

    #[test]
    fn decode_with_extension() {
        let (out, done) = decode_all(b"3;name=val\r\nfoo\r\n0\r\n\r\n");
        assert_eq!(out, b"foo");
        assert!(done);
    }

    #[test]
    fn malformed_size() {
        let mut decoder = ChunkedDecoder::new();
        let mut buf = Bytes::from_static(b"zz\r\n");
        assert_eq!(decoder.feed(&mut buf), ChunkEvent::Malformed);
    }

    #[test]
    fn encode_round_trip() {
        let mut encoded = Vec::new();
        encoded.extend_from_slice(&encode_chunk(b"hello "));
        encoded.extend_from_slice(&encode_chunk(b"world"));
        encoded.extend_from_slice(&final_chunk());
        let (out, done) = decode_all(&encoded);
        assert_eq!(out, b"hello world");
        assert!(done);
    }
}
