//! Redis serialization protocol (RESP2) dissector
//!
//! Commands are arrays of bulk strings whose first element names a known
//! command. Requests and replies carry no correlation id, so they pair by
//! position: `"{flow},redis/{n}"`.

use std::{
    collections::BTreeMap,
    io::{BufRead, Read},
};

use serde::Serialize;
use tap_api::{
    DissectError, Dissector, Exchange, GenericRecord, Message, Payload, Protocol, ProtocolId,
    TcpReader,
};

use crate::{claim, next_capture_time, read_up_to};

const REDIS: Protocol = Protocol {
    name:             "redis",
    long_name:        "Redis Serialization Protocol",
    abbreviation:     "REDIS",
    macro_name:       "redis",
    version:          "3.x",
    background_color: "#a41e11",
    foreground_color: "#ffffff",
    font_size:        11,
    reference_link:   "https://redis.io/topics/protocol",
    ports:            &["6379"],
    priority:         3,
};

static PROTOCOLS: [Protocol; 1] = [REDIS];

const MAX_LINE: u64 = 64 * 1024;
const MAX_BULK: i64 = 16 * 1024 * 1024;
const MAX_ELEMENTS: i64 = 1024 * 1024;
const MAX_DEPTH: usize = 8;

/// Command names accepted as the first element of a client array.
const COMMANDS: &[&str] = &[
    "APPEND", "AUTH", "BGREWRITEAOF", "BGSAVE", "BITCOUNT", "BITFIELD", "BITOP", "BITPOS",
    "BLMOVE", "BLPOP", "BRPOP", "BRPOPLPUSH", "BZPOPMAX", "BZPOPMIN", "CLIENT", "CLUSTER",
    "COMMAND", "CONFIG", "COPY", "DBSIZE", "DECR", "DECRBY", "DEL", "DISCARD", "DUMP", "ECHO",
    "EVAL", "EVALSHA", "EXEC", "EXISTS", "EXPIRE", "EXPIREAT", "FLUSHALL", "FLUSHDB", "GEOADD",
    "GEODIST", "GEOHASH", "GEOPOS", "GEORADIUS", "GEOSEARCH", "GET", "GETBIT", "GETDEL", "GETEX",
    "GETRANGE", "GETSET", "HDEL", "HELLO", "HEXISTS", "HGET", "HGETALL", "HINCRBY",
    "HINCRBYFLOAT", "HKEYS", "HLEN", "HMGET", "HMSET", "HSCAN", "HSET", "HSETNX", "HSTRLEN",
    "HVALS", "INCR", "INCRBY", "INCRBYFLOAT", "INFO", "KEYS", "LASTSAVE", "LINDEX", "LINSERT",
    "LLEN", "LMOVE", "LPOP", "LPOS", "LPUSH", "LPUSHX", "LRANGE", "LREM", "LSET", "LTRIM",
    "MEMORY", "MGET", "MIGRATE", "MONITOR", "MOVE", "MSET", "MSETNX", "MULTI", "OBJECT",
    "PERSIST", "PEXPIRE", "PEXPIREAT", "PFADD", "PFCOUNT", "PFMERGE", "PING", "PSETEX",
    "PSUBSCRIBE", "PTTL", "PUBLISH", "PUBSUB", "PUNSUBSCRIBE", "QUIT", "RANDOMKEY", "READONLY",
    "READWRITE", "RENAME", "RENAMENX", "RESTORE", "ROLE", "RPOP", "RPOPLPUSH", "RPUSH", "RPUSHX",
    "SADD", "SAVE", "SCAN", "SCARD", "SCRIPT", "SDIFF", "SDIFFSTORE", "SELECT", "SENTINEL",
    "SET", "SETBIT", "SETEX", "SETNX", "SETRANGE", "SHUTDOWN", "SINTER", "SINTERSTORE",
    "SISMEMBER", "SLAVEOF", "SLOWLOG", "SMEMBERS", "SMISMEMBER", "SMOVE", "SORT", "SPOP",
    "SRANDMEMBER", "SREM", "SSCAN", "STRLEN", "SUBSCRIBE", "SUNION", "SUNIONSTORE", "SWAPDB",
    "TIME", "TOUCH", "TTL", "TYPE", "UNLINK", "UNSUBSCRIBE", "UNWATCH", "WAIT", "WATCH", "XACK",
    "XADD", "XAUTOCLAIM", "XCLAIM", "XDEL", "XGROUP", "XINFO", "XLEN", "XPENDING", "XRANGE",
    "XREAD", "XREADGROUP", "XREVRANGE", "XTRIM", "ZADD", "ZCARD", "ZCOUNT", "ZDIFF", "ZINCRBY",
    "ZINTER", "ZINTERSTORE", "ZLEXCOUNT", "ZMSCORE", "ZPOPMAX", "ZPOPMIN", "ZRANGE",
    "ZRANGEBYLEX", "ZRANGEBYSCORE", "ZRANK", "ZREM", "ZREMRANGEBYLEX", "ZREMRANGEBYRANK",
    "ZREMRANGEBYSCORE", "ZREVRANGE", "ZREVRANGEBYSCORE", "ZREVRANK", "ZSCAN", "ZSCORE",
    "ZUNION", "ZUNIONSTORE",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct RedisDissector;

impl Dissector for RedisDissector {
    fn id(&self) -> ProtocolId {
        ProtocolId::Redis
    }

    fn protocols(&self) -> &'static [Protocol] {
        &PROTOCOLS
    }

    fn macros(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([("redis", format!(r#"proto.name == "{}""#, REDIS.name))])
    }

    fn dissect(&self, reader: &mut dyn TcpReader) -> Result<(), DissectError> {
        let mut claimed = false;
        loop {
            let time = next_capture_time(reader)?;
            let start = reader.read_progress();
            let value = match read_value(reader, 0) {
                Ok(Some(value)) => value,
                Ok(None) => break,
                Err(e) if claimed => return Err(e),
                Err(e) => return Err(DissectError::not_protocol(ProtocolId::Redis, e.to_string())),
            };
            let packet = RedisPacket::from_value(value);

            if reader.is_client() {
                let known = packet
                    .command
                    .as_deref()
                    .is_some_and(|c| COMMANDS.contains(&c));
                if !claimed && !known {
                    return Err(DissectError::not_protocol(
                        ProtocolId::Redis,
                        "client message is not a known command",
                    ));
                }
            }
            if !claimed {
                claim(reader, ProtocolId::Redis)?;
                claimed = true;
            }

            let size = reader.read_progress() - start;
            let record = GenericRecord {
                method:  packet.command.clone().unwrap_or_default(),
                summary: packet.summary(),
                details: serde_json::to_value(&packet).unwrap_or_default(),
            };
            let is_client = reader.is_client();
            let key = format!(
                "{},redis/{}",
                reader.flow_key(),
                reader.counter_pair().next(is_client)
            );
            let message = if is_client {
                Message::request(time, size, Payload::Generic(record))
            } else {
                Message::response(time, size, Payload::Generic(record))
            };
            if let Some(pair) = reader.register(key, message) {
                let exchange =
                    Exchange::paired(&REDIS, reader.capture(), &reader.connection_info(), pair);
                reader.emitter().emit(exchange);
            }
        }

        if claimed {
            Ok(())
        } else {
            Err(DissectError::not_protocol(
                ProtocolId::Redis,
                "stream ended before a complete message",
            ))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    fn type_name(&self) -> &'static str {
        match self {
            RespValue::Simple(_) => "Simple String",
            RespValue::Error(_) => "Error",
            RespValue::Integer(_) => "Integer",
            RespValue::Bulk(_) => "Bulk String",
            RespValue::Array(_) => "Array",
        }
    }

    fn render(&self) -> String {
        match self {
            RespValue::Simple(s) | RespValue::Error(s) => s.clone(),
            RespValue::Integer(n) => n.to_string(),
            RespValue::Bulk(Some(b)) => String::from_utf8_lossy(b).into_owned(),
            RespValue::Bulk(None) | RespValue::Array(None) => String::new(),
            RespValue::Array(Some(items)) => {
                let parts: Vec<String> = items.iter().map(RespValue::render).collect();
                format!("[{}]", parts.join(", "))
            },
        }
    }
}

/// Decoded form of one RESP message.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
struct RedisPacket {
    #[serde(rename = "type")]
    kind:    &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key:     Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value:   Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keyword: Option<String>,
}

impl RedisPacket {
    fn from_value(value: RespValue) -> Self {
        let mut packet = RedisPacket {
            kind: value.type_name(),
            ..Default::default()
        };
        match value {
            RespValue::Array(Some(items)) if matches!(items.first(), Some(RespValue::Bulk(Some(_)))) => {
                let mut items = items.into_iter();
                packet.command = items.next().map(|c| c.render().to_ascii_uppercase());
                packet.key = items.next().map(|k| k.render());
                let rest: Vec<String> = items.map(|v| v.render()).collect();
                packet.value = match rest.len() {
                    0 => None,
                    1 => rest.into_iter().next(),
                    _ => Some(format!("[{}]", rest.join(", "))),
                };
            },
            RespValue::Simple(s) => packet.keyword = Some(s.to_ascii_uppercase()),
            other => packet.value = Some(other.render()),
        }
        packet
    }

    fn summary(&self) -> String {
        self.key
            .clone()
            .or_else(|| self.keyword.clone())
            .or_else(|| self.value.clone())
            .unwrap_or_default()
    }
}

fn malformed(reason: impl Into<String>) -> DissectError {
    DissectError::malformed(ProtocolId::Redis, reason)
}

/// One CRLF-terminated line without the terminator; `Ok(None)` on EOF
/// before any byte.
fn read_line(reader: &mut dyn TcpReader) -> Result<Option<String>, DissectError> {
    let mut line = Vec::new();
    Read::take(&mut *reader, MAX_LINE).read_until(b'\n', &mut line)?;
    if line.is_empty() {
        return Ok(None);
    }
    if !line.ends_with(b"\r\n") {
        return Err(malformed("line not terminated by CRLF"));
    }
    line.truncate(line.len() - 2);
    String::from_utf8(line)
        .map(Some)
        .map_err(|_| malformed("line is not UTF-8"))
}

fn read_int(line: &str) -> Result<i64, DissectError> {
    line.parse()
        .map_err(|_| malformed(format!("bad integer {line:?}")))
}

/// Next RESP value; `Ok(None)` on a clean EOF.
fn read_value(reader: &mut dyn TcpReader, depth: usize) -> Result<Option<RespValue>, DissectError> {
    if depth > MAX_DEPTH {
        return Err(malformed("arrays nested too deeply"));
    }
    let Some(line) = read_line(reader)? else {
        return Ok(None);
    };
    let mut chars = line.chars();
    let Some(kind) = chars.next() else {
        return Err(malformed("empty line"));
    };
    let rest = chars.as_str();

    let value = match kind {
        '+' => RespValue::Simple(rest.to_string()),
        '-' => RespValue::Error(rest.to_string()),
        ':' => RespValue::Integer(read_int(rest)?),
        '$' => {
            let len = read_int(rest)?;
            if len < 0 {
                RespValue::Bulk(None)
            } else if len > MAX_BULK {
                return Err(malformed(format!("bulk string of {len} bytes")));
            } else {
                let mut data = read_up_to(reader, len as usize + 2)?;
                if data.len() < len as usize + 2 || !data.ends_with(b"\r\n") {
                    return Err(malformed("bulk string not terminated by CRLF"));
                }
                data.truncate(len as usize);
                RespValue::Bulk(Some(data))
            }
        },
        '*' => {
            let count = read_int(rest)?;
            if count < 0 {
                RespValue::Array(None)
            } else if count > MAX_ELEMENTS {
                return Err(malformed(format!("array of {count} elements")));
            } else {
                let mut items = Vec::with_capacity(count.min(64) as usize);
                for _ in 0..count {
                    let Some(item) = read_value(reader, depth + 1)? else {
                        return Err(malformed("stream ended inside an array"));
                    };
                    items.push(item);
                }
                RespValue::Array(Some(items))
            }
        },
        other => return Err(malformed(format!("unknown type byte {other:?}"))),
    };
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tap_api::TrafficFilteringOptions;

    use super::*;
    use crate::testing::{MockReader, at};

    fn command(parts: &[&str]) -> Vec<u8> {
        let mut out = format!("*{}\r\n", parts.len()).into_bytes();
        for p in parts {
            out.extend(format!("${}\r\n{p}\r\n", p.len()).into_bytes());
        }
        out
    }

    #[test]
    fn test_set_then_get_pairs_in_order() {
        let mut client_bytes = command(&["SET", "user:1", "alice"]);
        client_bytes.extend(command(&["get", "user:1"]));
        let (mut client, mut server, shared) = MockReader::pair(
            6379,
            vec![(client_bytes, at(0))],
            vec![(b"+OK\r\n".to_vec(), at(1)), (b"$5\r\nalice\r\n".to_vec(), at(3))],
            TrafficFilteringOptions::default(),
        );
        RedisDissector.dissect(&mut client).unwrap();
        RedisDissector.dissect(&mut server).unwrap();

        let exchanges = shared.exchanges();
        assert_eq!(exchanges.len(), 2);

        let set = exchanges[0].request.as_generic().unwrap();
        assert_eq!(set.method, "SET");
        assert_eq!(set.summary, "user:1");
        assert_eq!(set.details["value"], "alice");
        let ok = exchanges[0].response.as_ref().unwrap().as_generic().unwrap();
        assert_eq!(ok.details["keyword"], "OK");

        let get = exchanges[1].request.as_generic().unwrap();
        assert_eq!(get.method, "GET", "commands are upper-cased");
        let reply = exchanges[1].response.as_ref().unwrap().as_generic().unwrap();
        assert_eq!(reply.details["type"], "Bulk String");
        assert_eq!(reply.details["value"], "alice");
        assert_eq!(exchanges[1].elapsed_time, 3);
    }

    #[test]
    fn test_multi_argument_values_are_listed() {
        let packet = RedisPacket::from_value(RespValue::Array(Some(vec![
            RespValue::Bulk(Some(b"rpush".to_vec())),
            RespValue::Bulk(Some(b"q".to_vec())),
            RespValue::Bulk(Some(b"a".to_vec())),
            RespValue::Bulk(Some(b"b".to_vec())),
        ])));
        assert_eq!(packet.command.as_deref(), Some("RPUSH"));
        assert_eq!(packet.value.as_deref(), Some("[a, b]"));
    }

    #[rstest]
    #[case::integer(b":42\r\n".as_slice(), RespValue::Integer(42))]
    #[case::error(b"-ERR nope\r\n".as_slice(), RespValue::Error("ERR nope".to_string()))]
    #[case::null_bulk(b"$-1\r\n".as_slice(), RespValue::Bulk(None))]
    #[case::null_array(b"*-1\r\n".as_slice(), RespValue::Array(None))]
    #[case::nested(
        b"*2\r\n*1\r\n:1\r\n$0\r\n\r\n".as_slice(),
        RespValue::Array(Some(vec![
            RespValue::Array(Some(vec![RespValue::Integer(1)])),
            RespValue::Bulk(Some(Vec::new())),
        ]))
    )]
    fn test_read_value(#[case] bytes: &[u8], #[case] expected: RespValue) {
        let (_client, mut server, _shared) = MockReader::pair(
            6379,
            vec![],
            vec![(bytes.to_vec(), at(0))],
            TrafficFilteringOptions::default(),
        );
        assert_eq!(read_value(&mut server, 0).unwrap(), Some(expected));
    }

    #[test]
    fn test_value_split_across_chunks() {
        let (_client, mut server, _shared) = MockReader::pair(
            6379,
            vec![],
            vec![(b"$5\r\nhel".to_vec(), at(0)), (b"lo\r\n".to_vec(), at(1))],
            TrafficFilteringOptions::default(),
        );
        assert_eq!(
            read_value(&mut server, 0).unwrap(),
            Some(RespValue::Bulk(Some(b"hello".to_vec())))
        );
    }

    #[rstest]
    #[case::http(b"GET / HTTP/1.1\r\n\r\n".as_slice())]
    #[case::unknown_command(b"*1\r\n$5\r\nHELLX\r\n".as_slice())]
    #[case::bare_bulk(b"$2\r\nhi\r\n".as_slice())]
    fn test_client_rejects_non_commands(#[case] bytes: &[u8]) {
        let (mut client, _server, shared) = MockReader::pair(
            6379,
            vec![(bytes.to_vec(), at(0))],
            vec![],
            TrafficFilteringOptions::default(),
        );
        let err = RedisDissector.dissect(&mut client).unwrap_err();
        assert!(matches!(err, DissectError::NotProtocol { .. }));
        assert!(shared.protocol.lock().unwrap().is_none());
    }

    #[test]
    fn test_truncated_bulk_after_claim_is_malformed() {
        let mut bytes = command(&["PING"]);
        bytes.extend(b"*2\r\n$3\r\nGET\r\n$10\r\nshort".iter());
        let (mut client, _server, _shared) = MockReader::pair(
            6379,
            vec![(bytes, at(0))],
            vec![],
            TrafficFilteringOptions::default(),
        );
        let err = RedisDissector.dissect(&mut client).unwrap_err();
        assert!(matches!(err, DissectError::Malformed { .. }));
    }
}
