//! Kafka wire protocol dissector
//!
//! Every message is a big-endian `i32` size followed by that many bytes.
//! Requests start with `api_key`, `api_version`, `correlation_id` and
//! `client_id`; responses echo the correlation id, which is the pairing key.

use std::{collections::BTreeMap, thread, time::Duration};

use serde::Serialize;
use tap_api::{
    DissectError, Dissector, Exchange, GenericRecord, Message, Payload, Protocol, ProtocolId,
    TcpReader,
};
use tracing::debug;

use crate::{claim, next_capture_time, read_frame};

const KAFKA: Protocol = Protocol {
    name:             "kafka",
    long_name:        "Apache Kafka Protocol",
    abbreviation:     "KAFKA",
    macro_name:       "kafka",
    version:          "12",
    background_color: "#000000",
    foreground_color: "#ffffff",
    font_size:        11,
    reference_link:   "https://kafka.apache.org/protocol",
    ports:            &["9092"],
    priority:         2,
};

static PROTOCOLS: [Protocol; 1] = [KAFKA];

const MAX_MESSAGE_SIZE: i32 = 1_000_000;
const MAX_API_VERSION: i16 = 15;

/// API names indexed by api key.
const API_NAMES: &[&str] = &[
    "Produce",
    "Fetch",
    "ListOffsets",
    "Metadata",
    "LeaderAndIsr",
    "StopReplica",
    "UpdateMetadata",
    "ControlledShutdown",
    "OffsetCommit",
    "OffsetFetch",
    "FindCoordinator",
    "JoinGroup",
    "Heartbeat",
    "LeaveGroup",
    "SyncGroup",
    "DescribeGroups",
    "ListGroups",
    "SaslHandshake",
    "ApiVersions",
    "CreateTopics",
    "DeleteTopics",
    "DeleteRecords",
    "InitProducerId",
    "OffsetForLeaderEpoch",
    "AddPartitionsToTxn",
    "AddOffsetsToTxn",
    "EndTxn",
    "WriteTxnMarkers",
    "TxnOffsetCommit",
    "DescribeAcls",
    "CreateAcls",
    "DeleteAcls",
    "DescribeConfigs",
    "AlterConfigs",
    "AlterReplicaLogDirs",
    "DescribeLogDirs",
    "SaslAuthenticate",
    "CreatePartitions",
    "CreateDelegationToken",
    "RenewDelegationToken",
    "ExpireDelegationToken",
    "DescribeDelegationToken",
    "DeleteGroups",
    "ElectLeaders",
    "IncrementalAlterConfigs",
    "AlterPartitionReassignments",
    "ListPartitionReassignments",
    "OffsetDelete",
    "DescribeClientQuotas",
    "AlterClientQuotas",
    "DescribeUserScramCredentials",
    "AlterUserScramCredentials",
    "Vote",
    "BeginQuorumEpoch",
    "EndQuorumEpoch",
    "DescribeQuorum",
    "AlterPartition",
    "UpdateFeatures",
    "Envelope",
    "FetchSnapshot",
    "DescribeCluster",
    "DescribeProducers",
    "BrokerRegistration",
    "BrokerHeartbeat",
    "UnregisterBroker",
    "DescribeTransactions",
    "ListTransactions",
    "AllocateProducerIds",
];

const PRODUCE: i16 = 0;
const FETCH: i16 = 1;
const METADATA: i16 = 3;
const API_VERSIONS: i16 = 18;

/// Kafka dissector. A response waits up to `match_attempts` times
/// `match_interval` for the client reader to register its request.
#[derive(Debug, Clone)]
pub struct KafkaDissector {
    pub match_attempts: u32,
    pub match_interval: Duration,
}

impl Default for KafkaDissector {
    fn default() -> Self {
        Self {
            match_attempts: 10,
            match_interval: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestDetails {
    size:           i32,
    api_key_name:   &'static str,
    api_key:        i16,
    api_version:    i16,
    #[serde(rename = "correlationID")]
    correlation_id: i32,
    #[serde(rename = "clientID")]
    client_id:      String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    topics:         Vec<String>,
}

impl RequestDetails {
    fn summary(&self) -> String {
        if self.api_key == API_VERSIONS {
            return self.client_id.clone();
        }
        self.topics.join(", ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResponseDetails {
    size:           i32,
    #[serde(rename = "correlationID")]
    correlation_id: i32,
}

impl Dissector for KafkaDissector {
    fn id(&self) -> ProtocolId {
        ProtocolId::Kafka
    }

    fn protocols(&self) -> &'static [Protocol] {
        &PROTOCOLS
    }

    fn macros(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([("kafka", format!(r#"proto.name == "{}""#, KAFKA.name))])
    }

    fn dissect(&self, reader: &mut dyn TcpReader) -> Result<(), DissectError> {
        let mut claimed = false;
        loop {
            let time = next_capture_time(reader)?;
            let body = match read_message(reader) {
                Ok(Some(body)) => body,
                Ok(None) if claimed => return Ok(()),
                Ok(None) => {
                    return Err(DissectError::not_protocol(
                        ProtocolId::Kafka,
                        "stream ended before a complete message",
                    ));
                },
                Err(e @ DissectError::Io(_)) => return Err(e),
                Err(e) if claimed => return Err(e),
                Err(e) => return Err(DissectError::not_protocol(ProtocolId::Kafka, e.to_string())),
            };
            let size = body.len() + 4;
            let key_prefix = reader.flow_key();

            let (key, message) = if reader.is_client() {
                let details = match parse_request(&body) {
                    Ok(details) => details,
                    Err(e) if claimed => return Err(e),
                    Err(e) => {
                        return Err(DissectError::not_protocol(ProtocolId::Kafka, e.to_string()));
                    },
                };
                if !claimed {
                    claim(reader, ProtocolId::Kafka)?;
                    claimed = true;
                }
                let key = format!("{key_prefix},kafka/{}", details.correlation_id);
                let record = GenericRecord {
                    method:  details.api_key_name.to_string(),
                    summary: details.summary(),
                    details: serde_json::to_value(&details).unwrap_or_default(),
                };
                (key, Message::request(time, size, Payload::Generic(record)))
            } else {
                let correlation_id = match Decoder::new(&body).i32() {
                    Ok(id) => id,
                    Err(e) if claimed => return Err(e),
                    Err(e) => {
                        return Err(DissectError::not_protocol(ProtocolId::Kafka, e.to_string()));
                    },
                };
                let key = format!("{key_prefix},kafka/{correlation_id}");
                if !self.await_request(reader, &key) {
                    let reason = format!("no request with correlation id {correlation_id}");
                    return Err(if claimed {
                        DissectError::malformed(ProtocolId::Kafka, reason)
                    } else {
                        DissectError::not_protocol(ProtocolId::Kafka, reason)
                    });
                }
                if !claimed {
                    claim(reader, ProtocolId::Kafka)?;
                    claimed = true;
                }
                let details = ResponseDetails {
                    size: body.len() as i32,
                    correlation_id,
                };
                let record = GenericRecord {
                    method:  String::new(),
                    summary: String::new(),
                    details: serde_json::to_value(&details).unwrap_or_default(),
                };
                (key, Message::response(time, size, Payload::Generic(record)))
            };

            if let Some(pair) = reader.register(key, message) {
                let exchange =
                    Exchange::paired(&KAFKA, reader.capture(), &reader.connection_info(), pair);
                reader.emitter().emit(exchange);
            }
        }
    }
}

impl KafkaDissector {
    fn await_request(&self, reader: &dyn TcpReader, key: &str) -> bool {
        for attempt in 0..=self.match_attempts {
            if reader.matcher().has_pending_request(key) {
                return true;
            }
            if attempt < self.match_attempts {
                thread::sleep(self.match_interval);
            }
        }
        debug!(key, "Kafka response without a pending request");
        false
    }
}

fn malformed(reason: impl Into<String>) -> DissectError {
    DissectError::malformed(ProtocolId::Kafka, reason)
}

/// The bytes following the size prefix; `Ok(None)` on a clean EOF.
fn read_message(reader: &mut dyn TcpReader) -> Result<Option<Vec<u8>>, DissectError> {
    let Some(prefix) = read_frame(reader, 4, ProtocolId::Kafka)? else {
        return Ok(None);
    };
    let size = i32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    if size <= 0 || size > MAX_MESSAGE_SIZE {
        return Err(malformed(format!("message size {size}")));
    }
    let body = read_frame(reader, size as usize, ProtocolId::Kafka)?
        .ok_or_else(|| malformed("stream ended after size prefix"))?;
    Ok(Some(body))
}

fn parse_request(body: &[u8]) -> Result<RequestDetails, DissectError> {
    if body.len() < 8 {
        return Err(malformed("request header shorter than 8 bytes"));
    }
    let mut d = Decoder::new(body);
    let api_key = d.i16()?;
    let api_version = d.i16()?;
    let correlation_id = d.i32()?;
    let client_id = d.nullable_string()?.unwrap_or_default();

    let Some(api_key_name) = usize::try_from(api_key)
        .ok()
        .and_then(|k| API_NAMES.get(k).copied())
    else {
        return Err(malformed(format!("unsupported api key {api_key}")));
    };
    if !(0..=MAX_API_VERSION).contains(&api_version) {
        return Err(malformed(format!("unsupported api version {api_version}")));
    }

    // Topic names are best effort; payload layouts beyond the header vary per version.
    let topics = request_topics(&mut d, api_key, api_version).unwrap_or_default();

    Ok(RequestDetails {
        size: body.len() as i32,
        api_key_name,
        api_key,
        api_version,
        correlation_id,
        client_id,
        topics,
    })
}

/// Topic names of the non-flexible Produce, Fetch and Metadata versions.
/// Produce and Fetch topics carry nested partition data, so only the first
/// name is aligned.
fn request_topics(d: &mut Decoder<'_>, api_key: i16, version: i16) -> Option<Vec<String>> {
    match api_key {
        PRODUCE if version < 9 => {
            if version >= 3 {
                d.nullable_string().ok()?;
            }
            d.skip(6).ok()?;
            d.strings(false).ok()
        },
        FETCH if version < 12 => {
            let mut fixed = 12;
            if version >= 3 {
                fixed += 4;
            }
            if version >= 4 {
                fixed += 1;
            }
            if version >= 7 {
                fixed += 8;
            }
            d.skip(fixed).ok()?;
            d.strings(false).ok()
        },
        METADATA if version < 9 => d.strings(true).ok(),
        _ => None,
    }
}

/// Big-endian cursor over one message body.
struct Decoder<'a> {
    data: &'a [u8],
    pos:  usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DissectError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| malformed("field runs past end of message"))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<(), DissectError> {
        self.take(n).map(|_| ())
    }

    fn i16(&mut self) -> Result<i16, DissectError> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Result<i32, DissectError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn nullable_string(&mut self) -> Result<Option<String>, DissectError> {
        let len = self.i16()?;
        if len < 0 {
            return Ok(None);
        }
        let raw = self.take(len as usize)?;
        Ok(Some(String::from_utf8_lossy(raw).into_owned()))
    }

    /// An `i32`-counted array of strings, or just its first element.
    fn strings(&mut self, all: bool) -> Result<Vec<String>, DissectError> {
        let count = self.i32()?;
        let wanted = if all { count.max(0) } else { count.clamp(0, 1) };
        (0..wanted)
            .map(|_| Ok(self.nullable_string()?.unwrap_or_default()))
            .collect()
    }
}
