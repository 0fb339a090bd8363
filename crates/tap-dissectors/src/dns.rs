//! DNS over TCP
//!
//! Each message carries a 2-byte length prefix. Queries and answers pair by
//! transaction id. Only flows on port 53 are attempted.

use std::{
    collections::BTreeMap,
    net::{Ipv4Addr, Ipv6Addr},
};

use serde::Serialize;
use tap_api::{
    DissectError, Dissector, Exchange, GenericRecord, Message, Payload, Protocol, ProtocolId,
    TcpReader,
};

use crate::{claim, next_capture_time, read_frame};

const DNS: Protocol = Protocol {
    name:             "dns",
    long_name:        "Domain Name System",
    abbreviation:     "DNS",
    macro_name:       "dns",
    version:          "0",
    background_color: "#606060",
    foreground_color: "#ffffff",
    font_size:        12,
    reference_link:   "https://www.rfc-editor.org/rfc/rfc1035",
    ports:            &["53"],
    priority:         4,
};

static PROTOCOLS: [Protocol; 1] = [DNS];

const HEADER_LEN: usize = 12;
const MAX_POINTER_HOPS: usize = 16;
const MAX_RECORDS: u16 = 512;

#[derive(Debug, Clone, Copy, Default)]
pub struct DnsDissector;

impl Dissector for DnsDissector {
    fn id(&self) -> ProtocolId {
        ProtocolId::Dns
    }

    fn protocols(&self) -> &'static [Protocol] {
        &PROTOCOLS
    }

    fn macros(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([("dns", format!(r#"proto.name == "{}""#, DNS.name))])
    }

    fn dissect(&self, reader: &mut dyn TcpReader) -> Result<(), DissectError> {
        if !reader.is_dns() {
            return Err(DissectError::not_protocol(ProtocolId::Dns, "not a port 53 flow"));
        }
        let mut claimed = false;
        loop {
            let time = next_capture_time(reader)?;
            let (len, raw) = match read_message(reader) {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e @ DissectError::Malformed { .. }) if !claimed => {
                    return Err(DissectError::not_protocol(ProtocolId::Dns, e.to_string()));
                },
                Err(e) => return Err(e),
            };

            let message = match DnsMessage::parse(&raw) {
                Ok(message) => message,
                Err(reason) if claimed => {
                    reader.diagnostics().errors.silent("DNS-parser", &reason);
                    continue;
                },
                Err(reason) => return Err(DissectError::not_protocol(ProtocolId::Dns, reason)),
            };
            if message.is_response == reader.is_client() {
                let reason = "message direction does not match its QR bit";
                if claimed {
                    reader.diagnostics().errors.silent("DNS-parser", reason);
                    continue;
                }
                return Err(DissectError::not_protocol(ProtocolId::Dns, reason));
            }
            if !claimed {
                claim(reader, ProtocolId::Dns)?;
                claimed = true;
            }

            let key = format!("{},dns/{}", reader.flow_key(), message.id);
            let size = len + 2;
            let record = GenericRecord {
                method:  message.method(),
                summary: message.summary(),
                details: serde_json::to_value(&message).unwrap_or_default(),
            };
            let message = if message.is_response {
                Message::response(time, size, Payload::Generic(record))
            } else {
                Message::request(time, size, Payload::Generic(record))
            };
            if let Some(pair) = reader.register(key, message) {
                let exchange =
                    Exchange::paired(&DNS, reader.capture(), &reader.connection_info(), pair);
                reader.emitter().emit(exchange);
            }
        }

        if claimed {
            Ok(())
        } else {
            Err(DissectError::not_protocol(
                ProtocolId::Dns,
                "stream ended before a complete message",
            ))
        }
    }
}

/// Length and bytes of the next message; `Ok(None)` on a clean EOF.
fn read_message(reader: &mut dyn TcpReader) -> Result<Option<(usize, Vec<u8>)>, DissectError> {
    let Some(prefix) = read_frame(reader, 2, ProtocolId::Dns)? else {
        return Ok(None);
    };
    let len = u16::from_be_bytes([prefix[0], prefix[1]]) as usize;
    let raw = read_frame(reader, len, ProtocolId::Dns)?
        .ok_or_else(|| DissectError::malformed(ProtocolId::Dns, "empty message"))?;
    Ok(Some((len, raw)))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct DnsMessage {
    id:          u16,
    is_response: bool,
    opcode:      &'static str,
    rcode:       &'static str,
    recursion:   bool,
    questions:   Vec<Question>,
    answers:     Vec<Answer>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Question {
    name:  String,
    #[serde(rename = "type")]
    kind:  String,
    class: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Answer {
    name:  String,
    #[serde(rename = "type")]
    kind:  String,
    class: u16,
    ttl:   u32,
    data:  String,
}

impl DnsMessage {
    fn parse(raw: &[u8]) -> Result<Self, String> {
        if raw.len() < HEADER_LEN {
            return Err(format!("{} byte message is shorter than a header", raw.len()));
        }
        let mut r = Reader { data: raw, pos: 0 };
        let id = r.u16()?;
        let flags = r.u16()?;
        let qdcount = r.u16()?;
        let ancount = r.u16()?;
        r.u16()?;
        r.u16()?;
        if qdcount > MAX_RECORDS || ancount > MAX_RECORDS {
            return Err(format!("implausible record counts {qdcount}/{ancount}"));
        }
        let opcode = (flags >> 11) & 0x0f;
        if opcode > 6 || opcode == 3 {
            return Err(format!("unknown opcode {opcode}"));
        }

        let questions = (0..qdcount)
            .map(|_| {
                let name = r.name()?;
                let kind = record_type(r.u16()?);
                let class = r.u16()?;
                Ok(Question { name, kind, class })
            })
            .collect::<Result<Vec<_>, String>>()?;

        let answers = (0..ancount)
            .map(|_| r.answer())
            .collect::<Result<Vec<_>, String>>()?;

        Ok(DnsMessage {
            id,
            is_response: flags & 0x8000 != 0,
            opcode: opcode_name(opcode),
            rcode: rcode_name(flags & 0x000f),
            recursion: flags & 0x0100 != 0,
            questions,
            answers,
        })
    }

    fn method(&self) -> String {
        if self.is_response {
            self.rcode.to_string()
        } else {
            self.opcode.to_string()
        }
    }

    fn summary(&self) -> String {
        self.questions
            .first()
            .map(|q| format!("{} {}", q.kind, q.name))
            .unwrap_or_default()
    }
}

fn opcode_name(opcode: u16) -> &'static str {
    match opcode {
        0 => "QUERY",
        1 => "IQUERY",
        2 => "STATUS",
        4 => "NOTIFY",
        5 => "UPDATE",
        _ => "DSO",
    }
}

fn rcode_name(rcode: u16) -> &'static str {
    match rcode {
        0 => "NOERROR",
        1 => "FORMERR",
        2 => "SERVFAIL",
        3 => "NXDOMAIN",
        4 => "NOTIMP",
        5 => "REFUSED",
        _ => "RCODE",
    }
}

fn record_type(kind: u16) -> String {
    match kind {
        1 => "A".to_string(),
        2 => "NS".to_string(),
        5 => "CNAME".to_string(),
        6 => "SOA".to_string(),
        12 => "PTR".to_string(),
        15 => "MX".to_string(),
        16 => "TXT".to_string(),
        28 => "AAAA".to_string(),
        33 => "SRV".to_string(),
        255 => "ANY".to_string(),
        other => format!("TYPE{other}"),
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos:  usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        let end = self.pos + n;
        let Some(out) = self.data.get(self.pos..end) else {
            return Err("record runs past end of message".to_string());
        };
        self.pos = end;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, String> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, String> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// A possibly compressed name at the cursor.
    fn name(&mut self) -> Result<String, String> {
        let (name, end) = read_name(self.data, self.pos)?;
        self.pos = end;
        Ok(name)
    }

    fn answer(&mut self) -> Result<Answer, String> {
        let name = self.name()?;
        let kind = self.u16()?;
        let class = self.u16()?;
        let ttl = self.u32()?;
        let rdlength = self.u16()? as usize;
        let rdata_start = self.pos;
        let rdata = self.take(rdlength)?;

        let data = match kind {
            1 if rdlength == 4 => Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]).to_string(),
            28 if rdlength == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                Ipv6Addr::from(octets).to_string()
            },
            2 | 5 | 12 => read_name(self.data, rdata_start)?.0,
            15 if rdlength >= 3 => {
                let preference = u16::from_be_bytes([rdata[0], rdata[1]]);
                let exchange = read_name(self.data, rdata_start + 2)?.0;
                format!("{preference} {exchange}")
            },
            16 => txt_strings(rdata)?,
            1 | 28 | 15 => return Err(format!("bad rdata length {rdlength} for type {kind}")),
            _ => format!("{} bytes", rdlength),
        };
        Ok(Answer {
            name,
            kind: record_type(kind),
            class,
            ttl,
            data,
        })
    }
}

/// Decode the name at `start`, following compression pointers. Returns the
/// name and the offset just past it in the original position.
fn read_name(data: &[u8], start: usize) -> Result<(String, usize), String> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;
    let mut end = None;
    let mut hops = 0;
    loop {
        let Some(&len) = data.get(pos) else {
            return Err("name runs past end of message".to_string());
        };
        match len {
            0 => {
                end.get_or_insert(pos + 1);
                break;
            },
            l if l & 0xc0 == 0xc0 => {
                let Some(&low) = data.get(pos + 1) else {
                    return Err("truncated compression pointer".to_string());
                };
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return Err("compression pointer loop".to_string());
                }
                end.get_or_insert(pos + 2);
                pos = (((l & 0x3f) as usize) << 8) | low as usize;
            },
            l if l & 0xc0 != 0 => return Err(format!("unsupported label type {l:#x}")),
            l => {
                let Some(label) = data.get(pos + 1..pos + 1 + l as usize) else {
                    return Err("label runs past end of message".to_string());
                };
                labels.push(String::from_utf8_lossy(label).into_owned());
                pos += 1 + l as usize;
            },
        }
    }
    let name = if labels.is_empty() {
        ".".to_string()
    } else {
        labels.join(".")
    };
    Ok((name, end.unwrap_or(pos + 1)))
}

fn txt_strings(rdata: &[u8]) -> Result<String, String> {
    let mut parts = Vec::new();
    let mut pos = 0;
    while pos < rdata.len() {
        let len = rdata[pos] as usize;
        let Some(s) = rdata.get(pos + 1..pos + 1 + len) else {
            return Err("TXT string runs past rdata".to_string());
        };
        parts.push(String::from_utf8_lossy(s).into_owned());
        pos += 1 + len;
    }
    Ok(parts.join(" "))
}
