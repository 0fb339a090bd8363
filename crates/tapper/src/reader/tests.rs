use std::{collections::BTreeMap, io::Read};

use tap_api::{Exchange, Protocol};

use super::*;
use crate::stream::StreamReceivers;

#[derive(Default)]
struct Collect(Mutex<Vec<Exchange>>);

impl Emitter for Collect {
    fn emit(&self, exchange: Exchange) {
        self.0.lock().push(exchange);
    }
}

/// Reads a few bytes, then refuses the stream.
struct Refuses {
    id:       ProtocolId,
    peek:     usize,
    attempts: Arc<AtomicUsize>,
}

/// Consumes everything and records what it saw.
struct Accepts {
    id:   ProtocolId,
    seen: Arc<Mutex<Vec<u8>>>,
}

impl Dissector for Refuses {
    fn id(&self) -> ProtocolId {
        self.id
    }

    fn protocols(&self) -> &'static [Protocol] {
        &[]
    }

    fn macros(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::new()
    }

    fn dissect(&self, reader: &mut dyn TcpReader) -> Result<(), DissectError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let mut buf = vec![0; self.peek];
        reader.read_exact(&mut buf)?;
        Err(DissectError::not_protocol(self.id, "refused"))
    }
}

impl Dissector for Accepts {
    fn id(&self) -> ProtocolId {
        self.id
    }

    fn protocols(&self) -> &'static [Protocol] {
        &[]
    }

    fn macros(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::new()
    }

    fn dissect(&self, reader: &mut dyn TcpReader) -> Result<(), DissectError> {
        if !reader.identify(self.id) {
            return Err(DissectError::Claimed(reader.identified().unwrap_or(self.id)));
        }
        let mut all = Vec::new();
        reader.read_to_end(&mut all)?;
        self.seen.lock().extend_from_slice(&all);
        Ok(())
    }
}

fn new_stream(port: u16, dissectors: usize) -> (Arc<Stream>, StreamReceivers) {
    let id = TcpId {
        src_ip:   "10.0.0.1".parse().unwrap(),
        dst_ip:   "10.0.0.2".parse().unwrap(),
        src_port: 43210,
        dst_port: port,
        id:       1,
    };
    let matchers = (0..dissectors).map(|_| RequestResponseMatcher::new()).collect();
    let (stream, rx) = Stream::new(id, Capture::Pcap, Instant::now(), SystemTime::now(), false, matchers);
    (Arc::new(stream), rx)
}

fn context(dissectors: Vec<Box<dyn Dissector>>, emitter: Arc<Collect>) -> ReaderContext {
    ReaderContext {
        dissectors: Arc::new(dissectors),
        emitter,
        options: Arc::new(TrafficFilteringOptions::default()),
        diagnostics: Arc::new(Diagnostics::default()),
    }
}

fn chunk(data: &[u8], ms: u64) -> Chunk {
    Chunk {
        data:      data.to_vec(),
        timestamp: SystemTime::UNIX_EPOCH + Duration::from_millis(ms),
    }
}

#[test]
fn test_failed_dissector_is_followed_by_replay_from_first_byte() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let dissectors: Vec<Box<dyn Dissector>> = vec![
        Box::new(Refuses {
            id:       ProtocolId::Http1,
            peek:     6,
            attempts: attempts.clone(),
        }),
        Box::new(Accepts {
            id:   ProtocolId::Http2,
            seen: seen.clone(),
        }),
    ];
    let (stream, rx) = new_stream(80, 2);
    let reader = ChannelReader::new(rx.client, stream.clone(), true, context(dissectors, Arc::default()));

    stream.send(true, chunk(b"abcd", 1));
    stream.send(true, chunk(b"efgh", 2));
    stream.close();
    reader.run();

    assert_eq!(attempts.load(Ordering::Relaxed), 1);
    assert_eq!(&*seen.lock(), b"abcdefgh");
    assert_eq!(stream.protocol(), Some(ProtocolId::Http2));
}

#[test]
fn test_identified_stream_goes_straight_to_its_dissector() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let dissectors: Vec<Box<dyn Dissector>> = vec![
        Box::new(Refuses {
            id:       ProtocolId::Http1,
            peek:     1,
            attempts: attempts.clone(),
        }),
        Box::new(Accepts {
            id:   ProtocolId::Http2,
            seen: seen.clone(),
        }),
    ];
    let (stream, rx) = new_stream(80, 2);
    assert!(stream.identify(ProtocolId::Http2));
    let reader = ChannelReader::new(rx.server, stream.clone(), false, context(dissectors, Arc::default()));

    stream.send(false, chunk(b"xyz", 1));
    stream.close();
    reader.run();

    assert_eq!(attempts.load(Ordering::Relaxed), 0);
    assert_eq!(&*seen.lock(), b"xyz");
}

#[test]
fn test_unrecognised_bytes_are_drained_to_eof() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let dissectors: Vec<Box<dyn Dissector>> = vec![Box::new(Refuses {
        id:       ProtocolId::Http1,
        peek:     2,
        attempts: attempts.clone(),
    })];
    let (stream, rx) = new_stream(80, 1);
    let reader = ChannelReader::new(rx.client, stream.clone(), true, context(dissectors, Arc::default()));
    for i in 0..10 {
        stream.send(true, chunk(&[0xff; 32], i));
    }
    stream.close();
    reader.run();

    assert_eq!(attempts.load(Ordering::Relaxed), 1);
    assert_eq!(stream.protocol(), None);
}

#[test]
fn test_capture_time_follows_chunks() {
    let (stream, rx) = new_stream(80, 1);
    let mut reader = ChannelReader::new(rx.client, stream.clone(), true, context(Vec::new(), Arc::default()));
    stream.send(true, chunk(b"ab", 10));
    stream.send(true, chunk(b"cd", 20));
    stream.close();

    let mut two = [0u8; 2];
    reader.read_exact(&mut two).unwrap();
    assert_eq!(reader.capture_time(), SystemTime::UNIX_EPOCH + Duration::from_millis(10));
    reader.read_exact(&mut two).unwrap();
    assert_eq!(&two, b"cd");
    assert_eq!(reader.capture_time(), SystemTime::UNIX_EPOCH + Duration::from_millis(20));
    assert_eq!(reader.read_progress(), 4);
    assert_eq!(reader.read(&mut two).unwrap(), 0, "closed queue reads as EOF");
}

#[test]
fn test_http_exchange_through_reader_pair() {
    let emitter = Arc::new(Collect::default());
    let ctx = context(tap_dissectors::all_dissectors(1024 * 1024), emitter.clone());
    let (stream, rx) = new_stream(80, ProtocolId::ALL.len());

    let client = ChannelReader::new(rx.client, stream.clone(), true, ctx.clone());
    let server = ChannelReader::new(rx.server, stream.clone(), false, ctx);
    let pool = ReaderPool::default();
    pool.spawn("reader-1-c".into(), client).unwrap();
    pool.spawn("reader-1-s".into(), server).unwrap();

    stream.send(true, chunk(b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n", 1));
    stream.send(false, chunk(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok", 5));
    stream.close();

    assert_eq!(pool.join_all(Duration::from_secs(5)), 0);
    assert_eq!(pool.live(), 0);
    let exchanges = emitter.0.lock();
    assert_eq!(exchanges.len(), 1);
    let summary = exchanges[0].summary();
    assert_eq!(summary.method, "GET");
    assert_eq!(summary.status, Some(200));
    assert_eq!(exchanges[0].elapsed_time, 4);
    assert_eq!(stream.protocol(), Some(ProtocolId::Http1));
}
