//! Loopback port allocation, advertisement and discovery.
//!
//! The controller and the worker each listen on a loopback port and tell the
//! other side where through a small text file holding only the decimal port.

use crate::error::{BridgeError, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Every endpoint in the bridge binds here.
pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Answers whether something is listening on a loopback port.
pub trait ListenerProbe: Send + Sync {
    fn is_listening(&self, port: u16) -> bool;
}

/// Probes by attempting a bind: `AddrInUse` means a listener holds the port.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemListenerProbe;

impl ListenerProbe for SystemListenerProbe {
    fn is_listening(&self, port: u16) -> bool {
        match std::net::TcpListener::bind(SocketAddr::new(LOOPBACK, port)) {
            Ok(_) => false,
            Err(e) => e.kind() == std::io::ErrorKind::AddrInUse,
        }
    }
}

/// Picks free loopback ports.
#[derive(Clone)]
pub struct PortAllocator {
    probe: Arc<dyn ListenerProbe>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(Arc::new(SystemListenerProbe))
    }
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator").finish_non_exhaustive()
    }
}

impl PortAllocator {
    pub fn new(probe: Arc<dyn ListenerProbe>) -> Self {
        Self { probe }
    }

    /// Smallest port in `[preferred, max]` with no listener.
    ///
    /// Has no side effects; the port may be taken by the time the caller
    /// binds it, in which case the caller allocates again.
    ///
    /// # Errors
    ///
    /// [`BridgeError::ExhaustedRange`] if every port is taken or the range is
    /// empty.
    pub fn allocate(&self, preferred: u16, max: u16) -> Result<u16> {
        let exhausted = BridgeError::ExhaustedRange {
            start: preferred,
            end: max,
        };
        if preferred > max {
            return Err(exhausted);
        }
        let port = (preferred..=max)
            .find(|&p| !self.probe.is_listening(p))
            .ok_or(exhausted)?;
        tracing::debug!(port, skipped = port - preferred, "allocated port");
        Ok(port)
    }

    /// Allocates and binds a loopback listener in `[start, max]`, moving on
    /// to the next candidate whenever the bind loses a race.
    ///
    /// # Errors
    ///
    /// [`BridgeError::ExhaustedRange`] when no port can be bound, or
    /// [`BridgeError::Io`] for bind failures other than `AddrInUse`.
    pub async fn bind_with_fallback(&self, start: u16, max: u16) -> Result<TcpListener> {
        let mut next = start;
        loop {
            let port = self.allocate(next, max).map_err(|_| BridgeError::ExhaustedRange { start, end: max })?;
            match TcpListener::bind(SocketAddr::new(LOOPBACK, port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    tracing::debug!(port, "port taken between allocation and bind, retrying");
                    next = port.checked_add(1).ok_or(BridgeError::ExhaustedRange { start, end: max })?;
                }
                Err(e) => return Err(BridgeError::Io(e)),
            }
        }
    }
}

/// A port advertisement file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortFile {
    path: PathBuf,
}

impl PortFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the file content with `port`.
    ///
    /// Writes a sibling temp file and renames it over the target, so readers
    /// never see a partial value.
    ///
    /// # Errors
    ///
    /// I/O errors from creating, writing or renaming the file.
    pub fn advertise(&self, port: u16) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, port.to_string())?;
        std::fs::rename(&tmp, &self.path)?;
        tracing::info!(port, path = %self.path.display(), "advertised port");
        Ok(())
    }

    /// The advertised port. Missing or malformed content yields `None`.
    pub fn read(&self) -> Option<u16> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        match text.trim().parse::<u16>() {
            Ok(port) if port != 0 => Some(port),
            _ => {
                tracing::warn!(path = %self.path.display(), content = %text.trim(), "ignoring malformed port file");
                None
            }
        }
    }

    /// Deletes the file if present.
    pub fn remove(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(path = %self.path.display(), error = %e, "could not remove port file");
            }
        }
    }
}

/// Resolves the worker's RPC port.
///
/// Order: the advertised port; `default_port` if it has a listener; the
/// first listener in `default_port + 1 .. default_port + span`; finally
/// `default_port` regardless.
pub fn discover_worker_port(
    port_file: &PortFile,
    default_port: u16,
    span: u16,
    probe: &dyn ListenerProbe,
) -> u16 {
    if let Some(port) = port_file.read() {
        tracing::debug!(port, "worker port from port file");
        return port;
    }
    if probe.is_listening(default_port) {
        return default_port;
    }
    let start = default_port.saturating_add(1);
    let end = default_port.saturating_add(span.saturating_sub(1));
    if start <= end {
        if let Some(port) = (start..=end).find(|&p| probe.is_listening(p)) {
            tracing::info!(port, "found worker listener by scanning");
            return port;
        }
    }
    tracing::warn!(port = default_port, "worker port not advertised, assuming default");
    default_port
}

#[cfg(test)]
pub(crate) mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Probe reporting a fixed set of ports as listening.
    #[derive(Debug, Default)]
    pub(crate) struct FakeProbe(pub BTreeSet<u16>);

    impl FakeProbe {
        pub(crate) fn with(ports: &[u16]) -> Self {
            Self(ports.iter().copied().collect())
        }
    }

    impl ListenerProbe for FakeProbe {
        fn is_listening(&self, port: u16) -> bool {
            self.0.contains(&port)
        }
    }

    #[test]
    fn allocate_returns_smallest_free_port() {
        let allocator = PortAllocator::new(Arc::new(FakeProbe::with(&[60051, 60052, 60054])));
        assert_eq!(allocator.allocate(60051, 61000).unwrap(), 60053);
    }

    #[test]
    fn allocate_returns_preferred_when_free() {
        let allocator = PortAllocator::new(Arc::new(FakeProbe::default()));
        assert_eq!(allocator.allocate(60051, 61000).unwrap(), 60051);
    }

    #[derive(Default)]
    struct CountingProbe {
        busy: BTreeSet<u16>,
        probes: AtomicUsize,
    }

    impl ListenerProbe for CountingProbe {
        fn is_listening(&self, port: u16) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.busy.contains(&port)
        }
    }

    #[test]
    fn allocate_stops_probing_at_first_free_port() {
        let probe = Arc::new(CountingProbe {
            busy: [60051, 60052].into_iter().collect(),
            ..CountingProbe::default()
        });
        let allocator = PortAllocator::new(Arc::clone(&probe) as Arc<dyn ListenerProbe>);
        assert_eq!(allocator.allocate(60051, 61000).unwrap(), 60053);
        assert_eq!(probe.probes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn allocate_exhausted_range() {
        let allocator = PortAllocator::new(Arc::new(FakeProbe::with(&[7000, 7001, 7002])));
        let err = allocator.allocate(7000, 7002).unwrap_err();
        assert!(matches!(err, BridgeError::ExhaustedRange { start: 7000, end: 7002 }));
    }

    #[test]
    fn allocate_inverted_range_is_exhausted() {
        let allocator = PortAllocator::new(Arc::new(FakeProbe::default()));
        assert!(allocator.allocate(10, 5).is_err());
    }

    #[test]
    fn system_probe_sees_bound_listener() {
        let listener = std::net::TcpListener::bind((LOOPBACK, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(SystemListenerProbe.is_listening(port));
        drop(listener);
        assert!(!SystemListenerProbe.is_listening(port));
    }

    #[tokio::test]
    async fn bind_with_fallback_skips_taken_port() {
        let held = std::net::TcpListener::bind((LOOPBACK, 0)).unwrap();
        let port = held.local_addr().unwrap().port();
        // The fake probe claims every port is free, so the first bind loses.
        let allocator = PortAllocator::new(Arc::new(FakeProbe::default()));
        match allocator.bind_with_fallback(port, port.saturating_add(20)).await {
            Ok(listener) => assert_ne!(listener.local_addr().unwrap().port(), port),
            Err(e) => assert!(matches!(e, BridgeError::ExhaustedRange { .. })),
        }
    }

    #[tokio::test]
    async fn bind_with_fallback_single_taken_port_is_exhausted() {
        let held = std::net::TcpListener::bind((LOOPBACK, 0)).unwrap();
        let port = held.local_addr().unwrap().port();
        let allocator = PortAllocator::default();
        let err = allocator.bind_with_fallback(port, port).await.unwrap_err();
        assert!(matches!(err, BridgeError::ExhaustedRange { .. }));
    }

    #[test]
    fn port_file_roundtrip_and_replace() {
        let dir = tempfile::tempdir().unwrap();
        let file = PortFile::new(dir.path().join("nested").join("host_port.txt"));
        assert_eq!(file.read(), None);
        file.advertise(60051).unwrap();
        file.advertise(60052).unwrap();
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), "60052");
        assert_eq!(file.read(), Some(60052));
        file.remove();
        assert_eq!(file.read(), None);
    }

    #[test]
    fn malformed_port_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_port.txt");
        std::fs::write(&path, "not a port").unwrap();
        assert_eq!(PortFile::new(&path).read(), None);
        std::fs::write(&path, "70000").unwrap();
        assert_eq!(PortFile::new(&path).read(), None);
        std::fs::write(&path, " 50053\r\n").unwrap();
        assert_eq!(PortFile::new(&path).read(), Some(50053));
    }

    #[test]
    fn discovery_prefers_port_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = PortFile::new(dir.path().join("server_port.txt"));
        file.advertise(50057).unwrap();
        let probe = FakeProbe::with(&[50051]);
        assert_eq!(discover_worker_port(&file, 50051, 10, &probe), 50057);
    }

    #[test]
    fn discovery_uses_listening_default() {
        let dir = tempfile::tempdir().unwrap();
        let file = PortFile::new(dir.path().join("server_port.txt"));
        let probe = FakeProbe::with(&[50051, 50052]);
        assert_eq!(discover_worker_port(&file, 50051, 10, &probe), 50051);
    }

    #[test]
    fn discovery_scans_neighbouring_ports() {
        let dir = tempfile::tempdir().unwrap();
        let file = PortFile::new(dir.path().join("server_port.txt"));
        let probe = FakeProbe::with(&[50055, 50058]);
        assert_eq!(discover_worker_port(&file, 50051, 10, &probe), 50055);
    }

    #[test]
    fn discovery_scan_is_bounded_by_span() {
        let dir = tempfile::tempdir().unwrap();
        let file = PortFile::new(dir.path().join("server_port.txt"));
        let probe = FakeProbe::with(&[50061]);
        assert_eq!(discover_worker_port(&file, 50051, 10, &probe), 50051);
    }
}
