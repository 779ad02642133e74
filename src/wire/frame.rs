use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::codes::code_name;

/// Fixed TCP header, big-endian:
/// `code:16 seq:16 src:16 dest:16 opt:8 npar:8 len:16 from:32`.
pub const HEADER_LEN: usize = 16;

pub const MAX_PARAMS: usize = 32;
pub const MAX_BODY: usize = u16::MAX as usize;

/// Largest registry or arena range moved in one copy frame.
pub const CHUNK_MAX: usize = 60000;

/// Node field value meaning "the daemon itself / nobody".
pub const NO_NODE: u16 = 0xFFFF;

/// Receive buffer for header, params and short bodies.
pub const SMALL_BUF: usize = 512;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame carries {0} params, limit is {MAX_PARAMS}")]
    TooManyParams(usize),

    #[error("body of {0} bytes exceeds the frame limit")]
    BodyTooLarge(usize),

    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("{0} stray bytes after frame")]
    Trailing(usize),

    #[error("command {0:#06x} does not travel over udp")]
    NotDatagram(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub code: u16,
    pub seq: u16,
    pub src: u16,
    pub dest: u16,
    pub opt: u8,
    pub npar: u8,
    pub len: u16,
    pub from: u32,
}

impl Header {
    pub fn parse(mut buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                need: HEADER_LEN,
                have: buf.len(),
            });
        }
        let header = Header {
            code: buf.get_u16(),
            seq: buf.get_u16(),
            src: buf.get_u16(),
            dest: buf.get_u16(),
            opt: buf.get_u8(),
            npar: buf.get_u8(),
            len: buf.get_u16(),
            from: buf.get_u32(),
        };
        if header.npar as usize > MAX_PARAMS {
            return Err(CodecError::TooManyParams(header.npar as usize));
        }
        Ok(header)
    }

    /// Header plus params plus body.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + 4 * self.npar as usize + self.len as usize
    }
}

/// One TCP message between a daemon and a client or another daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u16,
    pub seq: u16,
    pub src: u16,
    pub dest: u16,
    pub opt: u8,
    /// Address of the daemon that first forwarded the frame, 0 if none.
    pub from: u32,
    pub params: Vec<i32>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(code: u16) -> Self {
        Self {
            code,
            seq: 0,
            src: NO_NODE,
            dest: NO_NODE,
            opt: 0,
            from: 0,
            params: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_src(mut self, src: u16) -> Self {
        self.src = src;
        self
    }

    pub fn with_dest(mut self, dest: u16) -> Self {
        self.dest = dest;
        self
    }

    pub fn with_opt(mut self, opt: u8) -> Self {
        self.opt = opt;
        self
    }

    pub fn with_seq(mut self, seq: u16) -> Self {
        self.seq = seq;
        self
    }

    pub fn with_params(mut self, params: impl Into<Vec<i32>>) -> Self {
        self.params = params.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn param(&self, i: usize) -> Option<i32> {
        self.params.get(i).copied()
    }

    pub fn from_ip(&self) -> Option<Ipv4Addr> {
        (self.from != 0).then(|| Ipv4Addr::from(self.from))
    }

    /// Body as text up to the first NUL.
    pub fn body_str(&self) -> String {
        let end = self
            .body
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.body.len());
        String::from_utf8_lossy(&self.body[..end]).into_owned()
    }

    pub fn header(&self) -> Header {
        Header {
            code: self.code,
            seq: self.seq,
            src: self.src,
            dest: self.dest,
            opt: self.opt,
            npar: self.params.len() as u8,
            len: self.body.len() as u16,
            from: self.from,
        }
    }

    /// Serializes header, params and `body` (which overrides `self.body`
    /// when given, so queued frames can carry live store bytes).
    pub fn encode_with(&self, body: Option<&[u8]>) -> Result<Bytes, CodecError> {
        let body = body.unwrap_or(&self.body[..]);
        if self.params.len() > MAX_PARAMS {
            return Err(CodecError::TooManyParams(self.params.len()));
        }
        if body.len() > MAX_BODY {
            return Err(CodecError::BodyTooLarge(body.len()));
        }
        let mut header = self.header();
        header.len = body.len() as u16;

        let mut buf = BytesMut::with_capacity(header.frame_len());
        buf.put_u16(header.code);
        buf.put_u16(header.seq);
        buf.put_u16(header.src);
        buf.put_u16(header.dest);
        buf.put_u8(header.opt);
        buf.put_u8(header.npar);
        buf.put_u16(header.len);
        buf.put_u32(header.from);
        for p in &self.params {
            buf.put_i32(*p);
        }
        buf.put_slice(body);
        Ok(buf.freeze())
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        self.encode_with(None)
    }

    /// Decodes exactly one frame.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let header = Header::parse(buf)?;
        let need = header.frame_len();
        if buf.len() < need {
            return Err(CodecError::Truncated {
                need,
                have: buf.len(),
            });
        }
        if buf.len() > need {
            return Err(CodecError::Trailing(buf.len() - need));
        }
        let mut rest = &buf[HEADER_LEN..];
        let params = (0..header.npar).map(|_| rest.get_i32()).collect();
        Ok(Frame {
            code: header.code,
            seq: header.seq,
            src: header.src,
            dest: header.dest,
            opt: header.opt,
            from: header.from,
            params,
            body: Bytes::copy_from_slice(rest),
        })
    }

    pub fn describe(&self) -> String {
        format!(
            "{} seq={} src={} dest={} opt={} pars={:?} len={}",
            code_name(self.code),
            self.seq,
            self.src,
            self.dest,
            self.opt,
            self.params,
            self.body.len()
        )
    }
}

/// Resumable receive-side reassembly.
///
/// Reads never cross a frame boundary: [`FrameReader::buf_mut`] hands out
/// exactly the bytes still missing from the current frame. Header, params
/// and short bodies land in a fixed buffer; a frame that does not fit gets a
/// dedicated buffer for its lifetime.
pub struct FrameReader {
    small: [u8; SMALL_BUF],
    large: Option<Vec<u8>>,
    filled: usize,
    target: usize,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            small: [0; SMALL_BUF],
            large: None,
            filled: 0,
            target: HEADER_LEN,
        }
    }

    /// Bytes received toward the frame in progress.
    pub fn pending(&self) -> usize {
        self.filled
    }

    pub fn buf_mut(&mut self) -> &mut [u8] {
        let (filled, target) = (self.filled, self.target);
        match self.large.as_mut() {
            Some(large) => &mut large[filled..target],
            None => &mut self.small[filled..target],
        }
    }

    /// Accounts for `n` bytes written into [`FrameReader::buf_mut`].
    pub fn advance(&mut self, n: usize) -> Result<Option<Frame>, CodecError> {
        self.filled += n;
        if self.filled < self.target {
            return Ok(None);
        }

        if self.filled == HEADER_LEN && self.target == HEADER_LEN {
            let header = match Header::parse(&self.small[..HEADER_LEN]) {
                Ok(header) => header,
                Err(e) => {
                    self.reset();
                    return Err(e);
                }
            };
            let total = header.frame_len();
            if total > HEADER_LEN {
                self.target = total;
                if total > SMALL_BUF {
                    let mut large = vec![0u8; total];
                    large[..HEADER_LEN].copy_from_slice(&self.small[..HEADER_LEN]);
                    self.large = Some(large);
                }
                return Ok(None);
            }
        }

        let frame = match self.large.take() {
            Some(large) => Frame::decode(&large),
            None => Frame::decode(&self.small[..self.target]),
        };
        self.reset();
        frame.map(Some)
    }

    /// Copies `data` in and returns every frame it completes.
    pub fn feed(&mut self, mut data: &[u8]) -> Result<Vec<Frame>, CodecError> {
        let mut frames = Vec::new();
        while !data.is_empty() {
            let buf = self.buf_mut();
            let n = buf.len().min(data.len());
            buf[..n].copy_from_slice(&data[..n]);
            data = &data[n..];
            if let Some(frame) = self.advance(n)? {
                frames.push(frame);
            }
        }
        Ok(frames)
    }

    fn reset(&mut self) {
        self.large = None;
        self.filled = 0;
        self.target = HEADER_LEN;
    }
}
