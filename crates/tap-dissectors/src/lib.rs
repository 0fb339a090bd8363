//! Protocol dissectors for the tapper.
//!
//! [`all_dissectors`] returns the chain in the order readers try them; a
//! dissector's position equals its [`ProtocolId`] index.

mod amqp;
mod dns;
mod http;
mod kafka;
mod redis;

pub use amqp::AmqpDissector;
pub use dns::DnsDissector;
pub use http::{Http1Dissector, Http2Dissector, REDACTED};
pub use kafka::KafkaDissector;
pub use redis::RedisDissector;

use std::time::SystemTime;

use h2session::H2Limits;
use tap_api::{DissectError, Dissector, ProtocolId, TcpReader};

/// The dissector chain. `http2_body_limit` caps accumulated HTTP/2 DATA per
/// stream.
pub fn all_dissectors(http2_body_limit: usize) -> Vec<Box<dyn Dissector>> {
    let chain: Vec<Box<dyn Dissector>> = vec![
        Box::new(Http1Dissector::new(http2_body_limit)),
        Box::new(Http2Dissector::new(H2Limits::with_max_body_size(http2_body_limit))),
        Box::new(AmqpDissector),
        Box::new(KafkaDissector::default()),
        Box::new(RedisDissector),
        Box::new(DnsDissector),
    ];
    debug_assert!(
        chain
            .iter()
            .enumerate()
            .all(|(i, d)| d.id() == ProtocolId::ALL[i])
    );
    chain
}

/// Read exactly `n` bytes, or fewer if the stream ends first.
pub(crate) fn read_up_to(reader: &mut dyn TcpReader, n: usize) -> Result<Vec<u8>, DissectError> {
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            break;
        }
        let take = available.len().min(n - out.len());
        out.extend_from_slice(&available[..take]);
        reader.consume(take);
    }
    Ok(out)
}

/// Read exactly `n` bytes; `Ok(None)` on a clean EOF before the first byte,
/// an error on EOF in the middle.
pub(crate) fn read_frame(
    reader: &mut dyn TcpReader,
    n: usize,
    protocol: ProtocolId,
) -> Result<Option<Vec<u8>>, DissectError> {
    let bytes = read_up_to(reader, n)?;
    if bytes.is_empty() && n > 0 {
        return Ok(None);
    }
    if bytes.len() < n {
        return Err(DissectError::malformed(protocol, "stream ended mid-message"));
    }
    Ok(Some(bytes))
}

/// Claim the stream, failing when the other direction chose differently.
pub(crate) fn claim(reader: &mut dyn TcpReader, protocol: ProtocolId) -> Result<(), DissectError> {
    if reader.identify(protocol) {
        return Ok(());
    }
    Err(DissectError::Claimed(
        reader.identified().unwrap_or(protocol),
    ))
}

/// Capture time of the data about to be read.
pub(crate) fn next_capture_time(reader: &mut dyn TcpReader) -> Result<SystemTime, DissectError> {
    reader.fill_buf()?;
    Ok(reader.capture_time())
}

#[cfg(test)]
pub(crate) mod testing;
