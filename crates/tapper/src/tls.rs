//! TLS ClientHello detection

/// Client chunks of a flow inspected for a handshake.
pub const MAX_INSPECTED_CHUNKS: usize = 100;

const CONTENT_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub version:     u16,
    pub server_name: Option<String>,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let out = self.buf.get(self.pos..self.pos.checked_add(n)?)?;
        self.pos += n;
        Some(out)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| usize::from(b[0]) << 16 | usize::from(b[1]) << 8 | usize::from(b[2]))
    }
}

/// Parse a TLS record carrying a ClientHello. Returns `None` for anything
/// else, including hellos cut short by the chunk boundary before the
/// session id.
pub fn parse_client_hello(data: &[u8]) -> Option<ClientHello> {
    let mut c = Cursor { buf: data, pos: 0 };
    if c.u8()? != CONTENT_HANDSHAKE {
        return None;
    }
    let record_version = c.u16()?;
    if record_version >> 8 != 0x03 {
        return None;
    }
    let _record_len = c.u16()?;
    if c.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let _hello_len = c.u24()?;
    let version = c.u16()?;
    c.take(32)?;
    let session_len = usize::from(c.u8()?);
    c.take(session_len)?;

    let mut hello = ClientHello {
        version,
        server_name: None,
    };
    let Some(suites_len) = c.u16() else {
        return Some(hello);
    };
    hello.server_name = (|| {
        c.take(usize::from(suites_len))?;
        let compression_len = usize::from(c.u8()?);
        c.take(compression_len)?;
        let ext_total = usize::from(c.u16()?);
        let mut ext = Cursor {
            buf: c.take(ext_total)?,
            pos: 0,
        };
        while let Some(kind) = ext.u16() {
            let len = usize::from(ext.u16()?);
            let body = ext.take(len)?;
            if kind == EXT_SERVER_NAME {
                return server_name(body);
            }
        }
        None
    })();
    Some(hello)
}

fn server_name(body: &[u8]) -> Option<String> {
    let mut c = Cursor { buf: body, pos: 0 };
    let list_len = usize::from(c.u16()?);
    let mut list = Cursor {
        buf: c.take(list_len)?,
        pos: 0,
    };
    while let Some(kind) = list.u8() {
        let len = usize::from(list.u16()?);
        let name = list.take(len)?;
        if kind == NAME_TYPE_HOST {
            return std::str::from_utf8(name).ok().map(str::to_string);
        }
    }
    None
}
