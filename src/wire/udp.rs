use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::codes::{Command, UDP_OFFSET};
use super::frame::{CodecError, MAX_PARAMS};

/// `req:8 npar:8 seq:16 par1:16 par2:16`, big-endian.
pub const UDP_HEADER_LEN: usize = 8;

/// Largest datagram the daemon sends or accepts.
pub const MAX_DATAGRAM: usize = 1472;

/// Largest segment payload carried by one data-copy datagram.
pub const UDP_BODY_MAX: usize = 1456;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub command: Command,
    pub seq: u16,
    pub par1: u16,
    pub par2: u16,
    pub params: Vec<i32>,
    pub body: Bytes,
}

impl Datagram {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            seq: 0,
            par1: 0,
            par2: 0,
            params: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_params(mut self, params: impl Into<Vec<i32>>) -> Self {
        self.params = params.into();
        self
    }

    pub fn with_short(mut self, par1: u16, par2: u16) -> Self {
        self.par1 = par1;
        self.par2 = par2;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        if !self.command.is_udp() {
            return Err(CodecError::NotDatagram(self.command.code()));
        }
        if self.params.len() > MAX_PARAMS {
            return Err(CodecError::TooManyParams(self.params.len()));
        }
        let len = UDP_HEADER_LEN + 4 * self.params.len() + self.body.len();
        if len > MAX_DATAGRAM {
            return Err(CodecError::BodyTooLarge(len));
        }

        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8((self.command.code() - UDP_OFFSET) as u8);
        buf.put_u8(self.params.len() as u8);
        buf.put_u16(self.seq);
        buf.put_u16(self.par1);
        buf.put_u16(self.par2);
        for p in &self.params {
            buf.put_i32(*p);
        }
        buf.put_slice(&self.body);
        Ok(buf.freeze())
    }

    /// `None` for datagrams that are not ours: unknown command byte or a
    /// command that only travels over TCP.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>, CodecError> {
        if buf.len() < UDP_HEADER_LEN {
            return Err(CodecError::Truncated {
                need: UDP_HEADER_LEN,
                have: buf.len(),
            });
        }
        if buf.len() > MAX_DATAGRAM {
            return Err(CodecError::BodyTooLarge(buf.len()));
        }
        let mut rest = buf;
        let req = rest.get_u8();
        let npar = rest.get_u8() as usize;
        let seq = rest.get_u16();
        let par1 = rest.get_u16();
        let par2 = rest.get_u16();

        let Some(command) = Command::from_code(req as u16 + UDP_OFFSET).filter(|c| c.is_udp())
        else {
            return Ok(None);
        };
        if npar > MAX_PARAMS {
            return Err(CodecError::TooManyParams(npar));
        }
        if rest.len() < 4 * npar {
            return Err(CodecError::Truncated {
                need: UDP_HEADER_LEN + 4 * npar,
                have: buf.len(),
            });
        }
        let params = (0..npar).map(|_| rest.get_i32()).collect();
        Ok(Some(Self {
            command,
            seq,
            par1,
            par2,
            params,
            body: Bytes::copy_from_slice(rest),
        }))
    }
}
