//! Protocol descriptors published by dissectors

use serde::Serialize;

/// Small integer identifying a dissector in the chain.
///
/// The discriminant is the dissector's index in the chain, so a stream's
/// identified protocol can be stored in an atomic byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ProtocolId {
    Http1 = 0,
    Http2 = 1,
    Amqp = 2,
    Kafka = 3,
    Redis = 4,
    Dns = 5,
}

impl ProtocolId {
    /// Every protocol, in dissector chain order
    pub const ALL: [ProtocolId; 6] = [
        ProtocolId::Http1,
        ProtocolId::Http2,
        ProtocolId::Amqp,
        ProtocolId::Kafka,
        ProtocolId::Redis,
        ProtocolId::Dns,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Http1 => "http/1",
            Self::Http2 => "http/2",
            Self::Amqp => "amqp",
            Self::Kafka => "kafka",
            Self::Redis => "redis",
            Self::Dns => "dns",
        }
    }
}

impl std::fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Static description of a protocol as shown to consumers of exchanges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Protocol {
    pub name:             &'static str,
    pub long_name:        &'static str,
    pub abbreviation:     &'static str,
    #[serde(rename = "macro")]
    pub macro_name:       &'static str,
    pub version:          &'static str,
    pub background_color: &'static str,
    pub foreground_color: &'static str,
    pub font_size:        i8,
    pub reference_link:   &'static str,
    pub ports:            &'static [&'static str],
    pub priority:         u8,
}

impl Protocol {
    /// Whether the protocol is conventionally served on `port`.
    pub fn default_port(&self, port: u16) -> bool {
        self.ports.iter().any(|p| p.parse() == Ok(port))
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.abbreviation, self.long_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_id_index_round_trip() {
        for (i, id) in ProtocolId::ALL.iter().enumerate() {
            assert_eq!(id.index(), i);
            assert_eq!(ProtocolId::from_index(i), Some(*id));
        }
        assert_eq!(ProtocolId::from_index(ProtocolId::ALL.len()), None);
    }

    #[test]
    fn test_descriptor_serializes_macro_field() {
        let p = Protocol {
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
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["macro"], "redis");
        assert_eq!(json["longName"], "Redis Serialization Protocol");
        assert!(p.default_port(6379));
        assert!(!p.default_port(80));
    }
}
