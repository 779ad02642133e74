//! Command code table.
//!
//! Administrative commands live in `0x0100..`; the three that travel over
//! UDP fit the one-byte UDP request field after subtracting [`UDP_OFFSET`].
//! Codes from [`REQUEST_FIRST`] up are application requests registered by
//! name in the registry.

pub use crate::registry::layout::REQUEST_CODE_BASE as REQUEST_FIRST;

pub const UDP_OFFSET: u16 = 0x0100;

/// Bumped whenever frames or the registry layout change incompatibly.
pub const PROTOCOL_VERSION: i32 = 1946;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    // udp
    NewDaemon,
    AckDaemon,
    UsrCpyMem,
    // tcp
    NewClient,
    DelClient,
    NewMaster,
    AllocMem,
    FlushMem,
    ReqCpyMem,
    SysCpyMem,
    OpenMem,
    CloseMem,
    KillDaemon,
    Ping,
    Pong,
    Ready,
    Nop,
    NewReq,
    DelReq,
}

const TABLE: [(Command, u16, &str); 19] = [
    (Command::NewDaemon, 0x0100, "NEWDAEMON"),
    (Command::AckDaemon, 0x0101, "ACKDAEMON"),
    (Command::UsrCpyMem, 0x0102, "USRCPYMEM"),
    (Command::NewClient, 0x0110, "NEWCLIENT"),
    (Command::DelClient, 0x0111, "DELCLIENT"),
    (Command::NewMaster, 0x0112, "NEWMASTER"),
    (Command::AllocMem, 0x0113, "ALLOCMEM"),
    (Command::FlushMem, 0x0114, "FLUSHMEM"),
    (Command::ReqCpyMem, 0x0115, "REQCPYMEM"),
    (Command::SysCpyMem, 0x0116, "SYSCPYMEM"),
    (Command::OpenMem, 0x0117, "OPENMEM"),
    (Command::CloseMem, 0x0118, "CLOSEMEM"),
    (Command::KillDaemon, 0x0119, "KILLDAEMON"),
    (Command::Ping, 0x011a, "PING"),
    (Command::Pong, 0x011b, "PONG"),
    (Command::Ready, 0x011c, "READY"),
    (Command::Nop, 0x011d, "NOP"),
    (Command::NewReq, 0x011e, "NEWREQ"),
    (Command::DelReq, 0x011f, "DELREQ"),
];

impl Command {
    pub fn code(self) -> u16 {
        TABLE
            .iter()
            .find(|(c, _, _)| *c == self)
            .map(|(_, code, _)| *code)
            .unwrap_or(0)
    }

    pub fn from_code(code: u16) -> Option<Self> {
        TABLE
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(cmd, _, _)| *cmd)
    }

    pub fn name(self) -> &'static str {
        TABLE
            .iter()
            .find(|(c, _, _)| *c == self)
            .map(|(_, _, name)| *name)
            .unwrap_or("?")
    }

    pub fn is_udp(self) -> bool {
        matches!(
            self,
            Command::NewDaemon | Command::AckDaemon | Command::UsrCpyMem
        )
    }
}

pub fn is_application(code: u16) -> bool {
    code >= REQUEST_FIRST
}

/// Human-readable code for log lines.
pub fn code_name(code: u16) -> String {
    match Command::from_code(code) {
        Some(cmd) => cmd.name().to_string(),
        None if is_application(code) => format!("REQ{:04x}", code),
        None => format!("?{:04x}", code),
    }
}

/// Printable prefix of a frame body for debug logging.
pub fn body_preview(body: &[u8]) -> String {
    let text: String = body
        .iter()
        .take(64)
        .take_while(|b| b.is_ascii_graphic() || **b == b' ')
        .map(|&b| b as char)
        .collect();
    if text.is_empty() && !body.is_empty() {
        format!("({} bytes)", body.len())
    } else {
        text
    }
}
