//! AMQP 0-9-1 dissector
//!
//! Frames are `type(1) channel(2) size(4) payload end(0xCE)`. Publishes and
//! the declare/bind/consume/connection methods become request-only
//! exchanges; `Basic.Deliver` is paired with the `Basic.Ack` carrying the
//! same delivery tag on the same channel.

use std::{
    collections::{BTreeMap, HashMap},
    time::SystemTime,
};

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tap_api::{
    DissectError, Dissector, Exchange, GenericRecord, Message, Payload, Protocol, ProtocolId,
    TcpReader,
};

use crate::{claim, next_capture_time, read_frame};

const AMQP: Protocol = Protocol {
    name:             "amqp",
    long_name:        "Advanced Message Queuing Protocol 0-9-1",
    abbreviation:     "AMQP",
    macro_name:       "amqp",
    version:          "0-9-1",
    background_color: "#ff6600",
    foreground_color: "#ffffff",
    font_size:        12,
    reference_link:   "https://www.rabbitmq.com/amqp-0-9-1-reference.html",
    ports:            &["5671", "5672"],
    priority:         1,
};

static PROTOCOLS: [Protocol; 1] = [AMQP];

/// Sent by the client before its first frame
const PROTOCOL_HEADER: &[u8; 8] = b"AMQP\x00\x00\x09\x01";

const FRAME_METHOD: u8 = 1;
const FRAME_HEADER: u8 = 2;
const FRAME_BODY: u8 = 3;
const FRAME_HEARTBEAT: u8 = 8;
const FRAME_END: u8 = 0xCE;
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const CLASS_CONNECTION: u16 = 10;
const CLASS_EXCHANGE: u16 = 40;
const CLASS_QUEUE: u16 = 50;
const CLASS_BASIC: u16 = 60;

#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpDissector;

impl Dissector for AmqpDissector {
    fn id(&self) -> ProtocolId {
        ProtocolId::Amqp
    }

    fn protocols(&self) -> &'static [Protocol] {
        &PROTOCOLS
    }

    fn macros(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([("amqp", format!(r#"proto.name == "{}""#, AMQP.name))])
    }

    fn dissect(&self, reader: &mut dyn TcpReader) -> Result<(), DissectError> {
        let mut claimed = false;
        let mut contents: HashMap<u16, PendingContent> = HashMap::new();

        loop {
            let time = next_capture_time(reader)?;
            let frame = match read_amqp_frame(reader, &mut claimed) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) if claimed || matches!(e, DissectError::Claimed(_)) => return Err(e),
                Err(e) => {
                    return Err(DissectError::not_protocol(ProtocolId::Amqp, e.to_string()));
                },
            };
            let size = frame.payload.len() + 8;

            match frame.kind {
                FRAME_HEARTBEAT => {},
                FRAME_METHOD => {
                    let method = match decode_method(&frame.payload) {
                        Ok(method) => method,
                        Err(e) if claimed => return Err(e),
                        Err(e) => {
                            return Err(DissectError::not_protocol(ProtocolId::Amqp, e.to_string()));
                        },
                    };
                    if !claimed && !matches!(method, Method::Unknown { .. }) {
                        claim(reader, ProtocolId::Amqp)?;
                        claimed = true;
                    }
                    match method {
                        Method::Publish(_) | Method::Deliver(_) => {
                            contents.insert(frame.channel, PendingContent {
                                method,
                                time,
                                size,
                                properties: Value::Null,
                                body_size: 0,
                                body: Vec::new(),
                                header_seen: false,
                            });
                        },
                        Method::Ack(ack) => {
                            let key = delivery_key(reader, frame.channel, ack.delivery_tag);
                            let details = serde_json::to_value(&ack).unwrap_or_default();
                            let record = generic(&Method::Ack(ack), details);
                            let message = Message::response(time, size, Payload::Generic(record));
                            if let Some(pair) = reader.register(key, message) {
                                let exchange = Exchange::paired(
                                    &AMQP,
                                    reader.capture(),
                                    &reader.connection_info(),
                                    pair,
                                );
                                reader.emitter().emit(exchange);
                            }
                        },
                        Method::Unknown { .. } => {},
                        other => {
                            let details = other.details();
                            emit_request_only(reader, time, size, generic(&other, details));
                        },
                    }
                },
                FRAME_HEADER => {
                    let Some(pending) = contents.get_mut(&frame.channel) else {
                        continue;
                    };
                    let (body_size, properties) = decode_content_header(&frame.payload)?;
                    pending.body_size = body_size;
                    pending.properties = properties;
                    pending.header_seen = true;
                    pending.size += size;
                },
                FRAME_BODY => {
                    let Some(pending) = contents.get_mut(&frame.channel) else {
                        continue;
                    };
                    pending.body.extend_from_slice(&frame.payload);
                    pending.size += size;
                },
                _ => {},
            }

            let complete = contents
                .get(&frame.channel)
                .is_some_and(|p| p.header_seen && p.body.len() as u64 >= p.body_size);
            if complete && let Some(done) = contents.remove(&frame.channel) {
                complete_content(reader, frame.channel, done);
            }
        }

        if claimed {
            Ok(())
        } else {
            Err(DissectError::not_protocol(
                ProtocolId::Amqp,
                "stream ended before a method frame",
            ))
        }
    }
}

struct Frame {
    kind:    u8,
    channel: u16,
    payload: Vec<u8>,
}

/// Next frame, skipping the protocol header. `Ok(None)` on a clean EOF.
fn read_amqp_frame(
    reader: &mut dyn TcpReader,
    claimed: &mut bool,
) -> Result<Option<Frame>, DissectError> {
    let Some(mut head) = read_frame(reader, 7, ProtocolId::Amqp)? else {
        return Ok(None);
    };
    if head.starts_with(b"AMQP") {
        let Some(rest) = read_frame(reader, 1, ProtocolId::Amqp)? else {
            return Err(malformed("truncated protocol header"));
        };
        head.extend(rest);
        if head.as_slice() != PROTOCOL_HEADER.as_slice() {
            return Err(malformed("unsupported protocol version"));
        }
        if !*claimed {
            claim(reader, ProtocolId::Amqp)?;
            *claimed = true;
        }
        let Some(next) = read_frame(reader, 7, ProtocolId::Amqp)? else {
            return Ok(None);
        };
        head = next;
    }

    let kind = head[0];
    if !matches!(kind, FRAME_METHOD | FRAME_HEADER | FRAME_BODY | FRAME_HEARTBEAT) {
        return Err(malformed(format!("unknown frame type {kind}")));
    }
    let channel = u16::from_be_bytes([head[1], head[2]]);
    let size = u32::from_be_bytes([head[3], head[4], head[5], head[6]]) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(malformed(format!("frame of {size} bytes")));
    }
    let Some(mut payload) = read_frame(reader, size + 1, ProtocolId::Amqp)? else {
        return Err(malformed("stream ended mid-frame"));
    };
    if payload.pop() != Some(FRAME_END) {
        return Err(malformed("missing frame end"));
    }
    Ok(Some(Frame {
        kind,
        channel,
        payload,
    }))
}

fn malformed(reason: impl Into<String>) -> DissectError {
    DissectError::malformed(ProtocolId::Amqp, reason)
}

fn delivery_key(reader: &dyn TcpReader, channel: u16, tag: u64) -> String {
    format!("{},amqp/{channel}/{tag}", reader.flow_key())
}

fn emit_request_only(reader: &dyn TcpReader, time: SystemTime, size: usize, record: GenericRecord) {
    let message = Message::request(time, size, Payload::Generic(record));
    let exchange = Exchange::request_only(
        &AMQP,
        reader.capture(),
        &reader.connection_info(),
        message,
    );
    reader.emitter().emit(exchange);
}

/// A publish or deliver waiting for its content header and body frames.
struct PendingContent {
    method:      Method,
    time:        SystemTime,
    size:        usize,
    properties:  Value,
    body_size:   u64,
    body:        Vec<u8>,
    header_seen: bool,
}

fn complete_content(reader: &dyn TcpReader, channel: u16, content: PendingContent) {
    let mut details = content.method.details();
    if let Value::Object(map) = &mut details {
        map.insert("properties".to_string(), content.properties);
        map.insert("body".to_string(), Value::String(STANDARD.encode(&content.body)));
    }
    let record = generic(&content.method, details);
    match &content.method {
        Method::Deliver(deliver) => {
            let key = delivery_key(reader, channel, deliver.delivery_tag);
            let message = Message::request(content.time, content.size, Payload::Generic(record));
            if let Some(pair) = reader.register(key, message) {
                let exchange =
                    Exchange::paired(&AMQP, reader.capture(), &reader.connection_info(), pair);
                reader.emitter().emit(exchange);
            }
        },
        _ => emit_request_only(reader, content.time, content.size, record),
    }
}

fn generic(method: &Method, details: Value) -> GenericRecord {
    GenericRecord {
        method: method.name().to_string(),
        summary: method.summary(),
        details,
    }
}

// =========================================================================
// Methods
// =========================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionStart {
    version_major:     u8,
    version_minor:     u8,
    server_properties: Value,
    mechanisms:        String,
    locales:           String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionClose {
    reply_code: u16,
    reply_text: String,
    class_id:   u16,
    method_id:  u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeDeclare {
    exchange:    String,
    #[serde(rename = "type")]
    kind:        String,
    passive:     bool,
    durable:     bool,
    auto_delete: bool,
    internal:    bool,
    no_wait:     bool,
    arguments:   Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueDeclare {
    queue:       String,
    passive:     bool,
    durable:     bool,
    exclusive:   bool,
    auto_delete: bool,
    no_wait:     bool,
    arguments:   Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueBind {
    queue:       String,
    exchange:    String,
    routing_key: String,
    no_wait:     bool,
    arguments:   Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct BasicConsume {
    queue:        String,
    consumer_tag: String,
    no_local:     bool,
    no_ack:       bool,
    exclusive:    bool,
    no_wait:      bool,
    arguments:    Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct BasicPublish {
    exchange:    String,
    routing_key: String,
    mandatory:   bool,
    immediate:   bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct BasicDeliver {
    consumer_tag: String,
    delivery_tag: u64,
    redelivered:  bool,
    exchange:     String,
    routing_key:  String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct BasicAck {
    delivery_tag: u64,
    multiple:     bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Method {
    Start(ConnectionStart),
    Close(ConnectionClose),
    ExchangeDeclare(ExchangeDeclare),
    QueueDeclare(QueueDeclare),
    QueueBind(QueueBind),
    Consume(BasicConsume),
    Publish(BasicPublish),
    Deliver(BasicDeliver),
    Ack(BasicAck),
    Unknown { class_id: u16, method_id: u16 },
}

impl Method {
    fn name(&self) -> &'static str {
        match self {
            Method::Start(_) => "connection start",
            Method::Close(_) => "connection close",
            Method::ExchangeDeclare(_) => "exchange declare",
            Method::QueueDeclare(_) => "queue declare",
            Method::QueueBind(_) => "queue bind",
            Method::Consume(_) => "basic consume",
            Method::Publish(_) => "basic publish",
            Method::Deliver(_) => "basic deliver",
            Method::Ack(_) => "basic ack",
            Method::Unknown { .. } => "unknown",
        }
    }

    fn summary(&self) -> String {
        match self {
            Method::Start(m) => format!("{}.{}", m.version_major, m.version_minor),
            Method::Close(m) => m.reply_text.clone(),
            Method::ExchangeDeclare(m) => m.exchange.clone(),
            Method::QueueDeclare(m) => m.queue.clone(),
            Method::QueueBind(m) => m.queue.clone(),
            Method::Consume(m) => m.queue.clone(),
            Method::Publish(m) => m.exchange.clone(),
            Method::Deliver(m) => m.exchange.clone(),
            Method::Ack(m) => m.delivery_tag.to_string(),
            Method::Unknown {
                class_id,
                method_id,
            } => format!("{class_id}.{method_id}"),
        }
    }

    fn details(&self) -> Value {
        let value = match self {
            Method::Start(m) => serde_json::to_value(m),
            Method::Close(m) => serde_json::to_value(m),
            Method::ExchangeDeclare(m) => serde_json::to_value(m),
            Method::QueueDeclare(m) => serde_json::to_value(m),
            Method::QueueBind(m) => serde_json::to_value(m),
            Method::Consume(m) => serde_json::to_value(m),
            Method::Publish(m) => serde_json::to_value(m),
            Method::Deliver(m) => serde_json::to_value(m),
            Method::Ack(m) => serde_json::to_value(m),
            Method::Unknown {
                class_id,
                method_id,
            } => Ok(json!({ "classId": class_id, "methodId": method_id })),
        };
        value.unwrap_or_default()
    }
}

fn decode_method(payload: &[u8]) -> Result<Method, DissectError> {
    let mut d = Decoder::new(payload);
    let class_id = d.u16()?;
    let method_id = d.u16()?;
    let method = match (class_id, method_id) {
        (CLASS_CONNECTION, 10) => Method::Start(ConnectionStart {
            version_major:     d.u8()?,
            version_minor:     d.u8()?,
            server_properties: d.table()?,
            mechanisms:        d.long_str()?,
            locales:           d.long_str()?,
        }),
        (CLASS_CONNECTION, 50) => Method::Close(ConnectionClose {
            reply_code: d.u16()?,
            reply_text: d.short_str()?,
            class_id:   d.u16()?,
            method_id:  d.u16()?,
        }),
        (CLASS_EXCHANGE, 10) => {
            d.u16()?;
            let exchange = d.short_str()?;
            let kind = d.short_str()?;
            let bits = d.u8()?;
            Method::ExchangeDeclare(ExchangeDeclare {
                exchange,
                kind,
                passive: bit(bits, 0),
                durable: bit(bits, 1),
                auto_delete: bit(bits, 2),
                internal: bit(bits, 3),
                no_wait: bit(bits, 4),
                arguments: d.table()?,
            })
        },
        (CLASS_QUEUE, 10) => {
            d.u16()?;
            let queue = d.short_str()?;
            let bits = d.u8()?;
            Method::QueueDeclare(QueueDeclare {
                queue,
                passive: bit(bits, 0),
                durable: bit(bits, 1),
                exclusive: bit(bits, 2),
                auto_delete: bit(bits, 3),
                no_wait: bit(bits, 4),
                arguments: d.table()?,
            })
        },
        (CLASS_QUEUE, 20) => {
            d.u16()?;
            let queue = d.short_str()?;
            let exchange = d.short_str()?;
            let routing_key = d.short_str()?;
            let bits = d.u8()?;
            Method::QueueBind(QueueBind {
                queue,
                exchange,
                routing_key,
                no_wait: bit(bits, 0),
                arguments: d.table()?,
            })
        },
        (CLASS_BASIC, 20) => {
            d.u16()?;
            let queue = d.short_str()?;
            let consumer_tag = d.short_str()?;
            let bits = d.u8()?;
            Method::Consume(BasicConsume {
                queue,
                consumer_tag,
                no_local: bit(bits, 0),
                no_ack: bit(bits, 1),
                exclusive: bit(bits, 2),
                no_wait: bit(bits, 3),
                arguments: d.table()?,
            })
        },
        (CLASS_BASIC, 40) => {
            d.u16()?;
            let exchange = d.short_str()?;
            let routing_key = d.short_str()?;
            let bits = d.u8()?;
            Method::Publish(BasicPublish {
                exchange,
                routing_key,
                mandatory: bit(bits, 0),
                immediate: bit(bits, 1),
            })
        },
        (CLASS_BASIC, 60) => {
            let consumer_tag = d.short_str()?;
            let delivery_tag = d.u64()?;
            let redelivered = bit(d.u8()?, 0);
            Method::Deliver(BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange: d.short_str()?,
                routing_key: d.short_str()?,
            })
        },
        (CLASS_BASIC, 80) => Method::Ack(BasicAck {
            delivery_tag: d.u64()?,
            multiple:     bit(d.u8()?, 0),
        }),
        _ => Method::Unknown {
            class_id,
            method_id,
        },
    };
    Ok(method)
}

fn bit(bits: u8, n: u8) -> bool {
    bits & (1 << n) != 0
}

/// Basic-class property names, most significant flag bit first
const BASIC_PROPERTIES: [&str; 14] = [
    "contentType",
    "contentEncoding",
    "headers",
    "deliveryMode",
    "priority",
    "correlationId",
    "replyTo",
    "expiration",
    "messageId",
    "timestamp",
    "type",
    "userId",
    "appId",
    "clusterId",
];

/// Body size and properties of a content header frame.
fn decode_content_header(payload: &[u8]) -> Result<(u64, Value), DissectError> {
    let mut d = Decoder::new(payload);
    let _class_id = d.u16()?;
    let _weight = d.u16()?;
    let body_size = d.u64()?;
    let flags = d.u16()?;

    let mut properties = Map::new();
    for (i, name) in BASIC_PROPERTIES.iter().enumerate() {
        if flags & (1 << (15 - i)) == 0 {
            continue;
        }
        let value = match *name {
            "headers" => d.table()?,
            "deliveryMode" | "priority" => Value::from(d.u8()?),
            "timestamp" => Value::from(d.u64()?),
            _ => Value::String(d.short_str()?),
        };
        properties.insert((*name).to_string(), value);
    }
    Ok((body_size, Value::Object(properties)))
}

// =========================================================================
// Wire decoding
// =========================================================================

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DissectError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| malformed("field runs past the frame"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DissectError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DissectError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DissectError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, DissectError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, DissectError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn short_str(&mut self) -> Result<String, DissectError> {
        let len = self.u8()? as usize;
        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }

    fn long_bytes(&mut self) -> Result<&'a [u8], DissectError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn long_str(&mut self) -> Result<String, DissectError> {
        Ok(String::from_utf8_lossy(self.long_bytes()?).into_owned())
    }

    /// Field table as a JSON object.
    fn table(&mut self) -> Result<Value, DissectError> {
        let mut inner = Decoder::new(self.long_bytes()?);
        let mut map = Map::new();
        while inner.pos < inner.buf.len() {
            let name = inner.short_str()?;
            let value = inner.field()?;
            map.insert(name, value);
        }
        Ok(Value::Object(map))
    }

    fn field(&mut self) -> Result<Value, DissectError> {
        let value = match self.u8()? {
            b't' => Value::Bool(self.u8()? != 0),
            b'b' => Value::from(i8::from_be_bytes(self.array()?)),
            b'B' => Value::from(self.u8()?),
            b's' => Value::from(i16::from_be_bytes(self.array()?)),
            b'u' => Value::from(self.u16()?),
            b'I' => Value::from(i32::from_be_bytes(self.array()?)),
            b'i' => Value::from(self.u32()?),
            b'l' => Value::from(i64::from_be_bytes(self.array()?)),
            b'f' => Value::from(f32::from_be_bytes(self.array()?)),
            b'd' => Value::from(f64::from_be_bytes(self.array()?)),
            b'D' => {
                let scale = self.u8()?;
                let digits = i32::from_be_bytes(self.array()?);
                Value::from(f64::from(digits) / 10f64.powi(i32::from(scale)))
            },
            b'S' => Value::String(self.long_str()?),
            b'x' => Value::String(STANDARD.encode(self.long_bytes()?)),
            b'A' => {
                let mut inner = Decoder::new(self.long_bytes()?);
                let mut items = Vec::new();
                while inner.pos < inner.buf.len() {
                    items.push(inner.field()?);
                }
                Value::Array(items)
            },
            b'T' => Value::from(self.u64()?),
            b'F' => self.table()?,
            b'V' => Value::Null,
            other => return Err(malformed(format!("unknown field type {:?}", other as char))),
        };
        Ok(value)
    }
}
