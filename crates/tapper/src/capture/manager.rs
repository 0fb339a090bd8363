use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use tap_api::{Capture, Diagnostics};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    Backend, CaptureError, PacketSource, RawPacket, SourceStats, discover_sidecars, in_netns,
    open_file, open_interface,
};
use crate::config::TappedPod;

/// Packets buffered between capture threads and the packet loop.
pub const PACKET_CHANNEL_CAPACITY: usize = 10_000;

const STATS_REFRESH: Duration = Duration::from_secs(5);
const BLOCKING_SEND_STEP: Duration = Duration::from_millis(100);

/// A captured frame and the source it came from.
#[derive(Debug, Clone)]
pub struct PacketInfo {
    pub packet:  RawPacket,
    pub capture: Capture,
    pub source:  Arc<str>,
}

enum Command {
    SetBpf(String),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SourceKey {
    Host,
    Sidecar(u32),
}

struct SourceHandle {
    name:     Arc<str>,
    key:      SourceKey,
    commands: Sender<Command>,
    stats:    Arc<Mutex<SourceStats>>,
    thread:   JoinHandle<()>,
}

struct SourceLoop {
    source:      Box<dyn PacketSource>,
    name:        Arc<str>,
    capture:     Capture,
    commands:    Receiver<Command>,
    stats:       Arc<Mutex<SourceStats>>,
    tx:          Sender<PacketInfo>,
    cancel:      CancellationToken,
    diagnostics: Arc<Diagnostics>,
    /// Cancelled when this source reaches the end of its input
    on_end:      Option<CancellationToken>,
}

impl SourceLoop {
    fn run(mut self) {
        let blocking = self.source.backend() == Backend::File;
        let mut refreshed = Instant::now();
        let mut ended = false;
        while !self.cancel.is_cancelled() {
            if !self.apply_commands() {
                break;
            }
            if refreshed.elapsed() >= STATS_REFRESH {
                self.refresh_stats();
                refreshed = Instant::now();
            }
            match self.source.next_packet() {
                Ok(Some(packet)) => {
                    let info = PacketInfo {
                        packet,
                        capture: self.capture,
                        source: self.name.clone(),
                    };
                    if !self.forward(info, blocking) {
                        break;
                    }
                },
                Ok(None) => {},
                Err(CaptureError::EndOfStream) => {
                    ended = true;
                    break;
                },
                Err(e) => {
                    self.diagnostics.errors.error("Capture-Read", format_args!("{}: {e}", self.name));
                    std::thread::sleep(Duration::from_millis(10));
                },
            }
        }
        self.refresh_stats();
        self.source.close();
        info!(
            event.name = "capture.source_stopped",
            source = %self.name,
            end_of_input = ended,
            "capture source stopped"
        );
        if let Some(on_end) = self.on_end {
            on_end.cancel();
        }
    }

    /// Apply pending commands; false on stop.
    fn apply_commands(&mut self) -> bool {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::SetBpf(expr) => match self.source.set_bpf(&expr) {
                    Ok(()) => debug!(source = %self.name, filter = %expr, "capture filter updated"),
                    // The previous filter stays in place
                    Err(e) => self
                        .diagnostics
                        .errors
                        .error("BPF-Update", format_args!("{}: {e}", self.name)),
                },
                Command::Stop => return false,
            }
        }
        true
    }

    fn refresh_stats(&mut self) {
        match self.source.stats() {
            Ok(stats) => *self.stats.lock() = stats,
            Err(e) => self
                .diagnostics
                .errors
                .silent("Capture-Stats", format_args!("{}: {e}", self.name)),
        }
    }

    /// Hand a packet to the packet loop; false once the loop is gone.
    /// Live sources drop packets when the channel is full, file replay
    /// waits.
    fn forward(&self, mut info: PacketInfo, blocking: bool) -> bool {
        if !blocking {
            return match self.tx.try_send(info) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    self.diagnostics.stats.inc_dropped_packets();
                    self.diagnostics
                        .errors
                        .silent("Packet-Channel-Full", &*self.name);
                    true
                },
                Err(TrySendError::Disconnected(_)) => false,
            };
        }
        loop {
            match self.tx.send_timeout(info, BLOCKING_SEND_STEP) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => {
                    if self.cancel.is_cancelled() {
                        return false;
                    }
                    info = back;
                },
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}

/// Every capture source of the process, each on its own thread.
pub struct SourceManager {
    sources:      Mutex<Vec<SourceHandle>>,
    tx:           Sender<PacketInfo>,
    iface:        String,
    procfs:       PathBuf,
    service_mesh: bool,
    cancel:       CancellationToken,
    host_ended:   CancellationToken,
    diagnostics:  Arc<Diagnostics>,
}

impl SourceManager {
    pub fn new(
        tx: Sender<PacketInfo>,
        iface: &str,
        procfs: &Path,
        service_mesh: bool,
        cancel: CancellationToken,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            sources: Mutex::new(Vec::new()),
            tx,
            iface: iface.to_string(),
            procfs: procfs.to_path_buf(),
            service_mesh,
            cancel,
            host_ended: CancellationToken::new(),
            diagnostics,
        }
    }

    /// Cancelled when the host source runs out of input, i.e. a replayed
    /// file is finished.
    pub fn host_ended(&self) -> CancellationToken {
        self.host_ended.clone()
    }

    fn spawn(
        &self,
        source: Box<dyn PacketSource>,
        capture: Capture,
        key: SourceKey,
    ) -> Result<(), CaptureError> {
        let name: Arc<str> = Arc::from(source.name());
        let (commands, commands_rx) = channel::unbounded();
        let stats = Arc::new(Mutex::new(SourceStats::default()));
        let worker = SourceLoop {
            source,
            name: name.clone(),
            capture,
            commands: commands_rx,
            stats: stats.clone(),
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
            diagnostics: self.diagnostics.clone(),
            on_end: (key == SourceKey::Host).then(|| self.host_ended.clone()),
        };
        let thread = std::thread::Builder::new()
            .name(format!("capture-{name}"))
            .spawn(move || worker.run())
            .map_err(CaptureError::io("spawn capture thread"))?;
        self.sources.lock().push(SourceHandle {
            name,
            key,
            commands,
            stats,
            thread,
        });
        Ok(())
    }

    /// Open the host source: `pcap_file` when given, the configured
    /// interface otherwise. Failure here is fatal to the caller.
    pub fn open_host(&self, pcap_file: Option<&Path>, filter: Option<&str>) -> Result<(), CaptureError> {
        let source = match pcap_file {
            Some(path) => open_file(path, filter)?,
            None => open_interface(&format!("host-{}", self.iface), &self.iface, filter)?,
        };
        self.spawn(source, Capture::Pcap, SourceKey::Host)
    }

    /// Add a source directly; used for sources opened by the caller.
    pub fn add(&self, source: Box<dyn PacketSource>, capture: Capture) -> Result<(), CaptureError> {
        self.spawn(source, capture, SourceKey::Host)
    }

    /// Replace the capture filter on every source. Sources that fail keep
    /// their previous filter.
    pub fn set_bpf_all(&self, expr: &str) {
        let sources = self.sources.lock();
        for source in sources.iter() {
            if source.commands.send(Command::SetBpf(expr.to_string())).is_err() {
                self.diagnostics
                    .errors
                    .silent("BPF-Update", format_args!("{}: source stopped", source.name));
            }
        }
        info!(
            event.name = "capture.filter_applied",
            filter = expr,
            sources = sources.len(),
            "capture filter sent to sources"
        );
    }

    /// Attach to the sidecars of `pods` and detach from sidecars that no
    /// longer serve a tapped pod. No-op unless service-mesh capture is on.
    pub fn sync_sidecars(&self, pods: &[TappedPod], filter: Option<&str>) -> usize {
        if !self.service_mesh {
            return 0;
        }
        let sidecars = match discover_sidecars(&self.procfs, pods) {
            Ok(sidecars) => sidecars,
            Err(e) => {
                warn!(
                    event.name = "discovery.failed",
                    procfs = %self.procfs.display(),
                    error = %e,
                    "sidecar discovery failed"
                );
                return 0;
            },
        };
        let wanted: HashSet<u32> = sidecars.iter().map(|s| s.pid).collect();
        self.sources.lock().retain(|s| match s.key {
            SourceKey::Sidecar(pid) if !wanted.contains(&pid) => {
                let _ = s.commands.send(Command::Stop);
                info!(event.name = "capture.sidecar_detached", source = %s.name, "sidecar gone");
                false
            },
            _ => true,
        });
        let attached: HashSet<u32> = self
            .sources
            .lock()
            .iter()
            .filter_map(|s| match s.key {
                SourceKey::Sidecar(pid) => Some(pid),
                SourceKey::Host => None,
            })
            .collect();

        let mut added = 0;
        for sidecar in sidecars.into_iter().filter(|s| !attached.contains(&s.pid)) {
            let name = format!("netns-{}-{}", sidecar.pid, self.iface);
            let iface = self.iface.clone();
            let filter = filter.map(str::to_string);
            let opened = in_netns(&self.procfs, sidecar.pid, move || {
                open_interface(&name, &iface, filter.as_deref())
            });
            match opened.and_then(|source| {
                self.spawn(source, sidecar.capture, SourceKey::Sidecar(sidecar.pid))
            }) {
                Ok(()) => {
                    info!(
                        event.name = "capture.sidecar_attached",
                        pid = sidecar.pid,
                        pod = %sidecar.pod,
                        capture = %sidecar.capture,
                        "capturing inside sidecar namespace"
                    );
                    added += 1;
                },
                Err(e) => self
                    .diagnostics
                    .errors
                    .error("Netns", format_args!("pid {}: {e}", sidecar.pid)),
            }
        }
        added
    }

    /// Latest statistics of every source, by name.
    pub fn stats(&self) -> Vec<(Arc<str>, SourceStats)> {
        self.sources
            .lock()
            .iter()
            .map(|s| (s.name.clone(), *s.stats.lock()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sources.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.lock().is_empty()
    }

    /// Stop every source and wait for its thread.
    pub fn close(&self) {
        let sources: Vec<SourceHandle> = self.sources.lock().drain(..).collect();
        for source in &sources {
            let _ = source.commands.send(Command::Stop);
        }
        for source in sources {
            if source.thread.join().is_err() {
                warn!(source = %source.name, "capture thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
        time::SystemTime,
    };

    use super::*;
    use crate::capture::LinkType;

    struct Scripted {
        backend: Backend,
        packets: VecDeque<Vec<u8>>,
        filters: Arc<Mutex<Vec<String>>>,
        reject:  bool,
        closed:  Arc<AtomicUsize>,
    }

    impl Scripted {
        fn new(backend: Backend, count: usize) -> Self {
            Self {
                backend,
                packets: (0..count).map(|i| vec![i as u8; 4]).collect(),
                filters: Arc::default(),
                reject: false,
                closed: Arc::default(),
            }
        }
    }

    impl PacketSource for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn backend(&self) -> Backend {
            self.backend
        }

        fn next_packet(&mut self) -> Result<Option<RawPacket>, CaptureError> {
            match self.packets.pop_front() {
                Some(data) => Ok(Some(RawPacket {
                    data,
                    timestamp: SystemTime::UNIX_EPOCH,
                    link_type: LinkType::Ethernet,
                })),
                None if self.backend == Backend::File => Err(CaptureError::EndOfStream),
                None => {
                    std::thread::sleep(Duration::from_millis(5));
                    Ok(None)
                },
            }
        }

        fn set_bpf(&mut self, expr: &str) -> Result<(), CaptureError> {
            if self.reject {
                return Err(CaptureError::Filter {
                    expr:   expr.to_string(),
                    reason: "rejected".to_string(),
                });
            }
            self.filters.lock().push(expr.to_string());
            Ok(())
        }

        fn link_type(&self) -> LinkType {
            LinkType::Ethernet
        }

        fn stats(&mut self) -> Result<SourceStats, CaptureError> {
            Ok(SourceStats {
                received: 7,
                ..SourceStats::default()
            })
        }

        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn manager(capacity: usize) -> (SourceManager, Receiver<PacketInfo>, Arc<Diagnostics>) {
        let (tx, rx) = channel::bounded(capacity);
        let diagnostics = Arc::new(Diagnostics::default());
        let manager = SourceManager::new(
            tx,
            "eth0",
            Path::new("/proc"),
            false,
            CancellationToken::new(),
            diagnostics.clone(),
        );
        (manager, rx, diagnostics)
    }

    #[test]
    fn test_file_replay_is_lossless_and_signals_end() {
        let (manager, rx, _) = manager(2);
        let ended = manager.host_ended();
        let source = Scripted::new(Backend::File, 50);
        let closed = source.closed.clone();
        manager.add(Box::new(source), Capture::Pcap).unwrap();

        let received: Vec<PacketInfo> = (0..50).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(received[49].packet.data, vec![49; 4]);
        assert_eq!(&*received[0].source, "scripted");

        let deadline = Instant::now() + Duration::from_secs(5);
        while !ended.is_cancelled() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(ended.is_cancelled());
        manager.close();
        assert_eq!(closed.load(Ordering::Relaxed), 1);
        assert_eq!(manager.stats().len(), 0);
    }

    #[test]
    fn test_live_source_drops_when_channel_full() {
        let (manager, rx, diagnostics) = manager(1);
        manager
            .add(Box::new(Scripted::new(Backend::Pcap, 5)), Capture::Pcap)
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while diagnostics.stats.snapshot().dropped_packets_count < 4 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        manager.close();
        assert_eq!(rx.len(), 1);
        assert_eq!(diagnostics.stats.snapshot().dropped_packets_count, 4);
        assert_eq!(diagnostics.errors.count("Packet-Channel-Full"), 4);
    }

    #[test]
    fn test_bpf_updates_reach_sources() {
        let (manager, _rx, diagnostics) = manager(16);
        let good = Scripted::new(Backend::Pcap, 0);
        let filters = good.filters.clone();
        let mut bad = Scripted::new(Backend::Pcap, 0);
        bad.reject = true;
        manager.add(Box::new(good), Capture::Pcap).unwrap();
        manager.add(Box::new(bad), Capture::Envoy).unwrap();

        manager.set_bpf_all("port not 443");
        let deadline = Instant::now() + Duration::from_secs(5);
        while (filters.lock().is_empty() || diagnostics.errors.count("BPF-Update") == 0)
            && Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(5));
        }
        manager.close();
        assert_eq!(*filters.lock(), vec!["port not 443".to_string()]);
        assert_eq!(diagnostics.errors.count("BPF-Update"), 1);
    }

    #[test]
    fn test_sidecar_sync_is_noop_without_service_mesh() {
        let (manager, _rx, _) = manager(1);
        assert_eq!(manager.sync_sidecars(&[], None), 0);
        assert!(manager.is_empty());
    }
}
