// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rdds contributors

//! Same-host shared-memory transport (Linux).
//!
//! Every instance owns one receive pool: a named shm segment holding a
//! byte ring, plus a named process-shared semaphore. Sending to a peer
//! means mapping the peer's pool, appending a record, and posting the
//! peer's semaphore; the peer's polling thread wakes, drains its ring, and
//! demuxes records to links by the sender key embedded in each record:
//!
//! ```text
//! +----------------+-------------------------+-----------+
//! | src_len (2 BE) | src = hostname \0 pool  | payload   |
//! +----------------+-------------------------+-----------+
//! ```
//!
//! Locators name `(hostname, pool)`; a blob for a different hostname is
//! structurally unreachable and rejected during decode, before any
//! connection attempt.
//!
//! Teardown order matters: stop flag, post own semaphore, join the polling
//! thread, then close/unlink the semaphore and segment.

#[cfg(target_os = "linux")]
pub mod ring;
#[cfg(target_os = "linux")]
pub mod segment;

#[cfg(target_os = "linux")]
pub use imp::ShmemTransport;

/// Hostname of this machine, as used in shared-memory locators.
pub fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is a valid writable buffer of the stated length;
    // gethostname NUL-terminates on success.
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if ret == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        if let Ok(name) = std::str::from_utf8(&buf[..end]) {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Sanitize a pool name for POSIX shm object naming.
pub fn sanitize_pool_name(pool: &str) -> String {
    pool.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(target_os = "linux")]
mod imp {
    use std::io::{self, IoSlice};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;

    use crate::config::{ShmemInst, TransportInst, TransportKind};
    use crate::error::{Result, TransportError};
    use crate::link::DataLink;
    use crate::locator::{LocatorBlob, RemoteAddress, LOCATOR_KIND_SHMEM};
    use crate::strategy::recv::ReceivedDataSample;
    use crate::strategy::send::WireSender;
    use crate::transport::{key_or_not_found, mark_all_lost, release_link, LinkTable, Transport};

    use super::ring::{ShmemRing, RING_HEADER_LEN};
    use super::segment::ShmemSegment;
    use super::{local_hostname, sanitize_pool_name};

    /// Poll slice so the reader observes shutdown promptly.
    const POLL_TIMEOUT: Duration = Duration::from_millis(100);

    /// Retry interval while waiting for a peer's pool to appear.
    const ATTACH_RETRY: Duration = Duration::from_millis(50);

    fn segment_name(pool: &str) -> String {
        format!("/rdds_{}", sanitize_pool_name(pool))
    }

    fn semaphore_name(pool: &str) -> String {
        format!("/rdds_{}_sem", sanitize_pool_name(pool))
    }

    // ========================================================================
    // Named semaphore
    // ========================================================================

    /// Process-shared POSIX named semaphore.
    struct NamedSemaphore {
        sem: *mut libc::sem_t,
        name: String,
        owner: bool,
    }

    // SAFETY: sem_t handles from sem_open are usable from any thread;
    // post/wait are async-signal-safe kernel operations.
    unsafe impl Send for NamedSemaphore {}
    unsafe impl Sync for NamedSemaphore {}

    impl NamedSemaphore {
        fn create(name: &str) -> Result<Self> {
            let c_name = std::ffi::CString::new(name)
                .map_err(|_| TransportError::UnableToCreate(format!("NUL in sem name {}", name)))?;
            // SAFETY: valid NUL-terminated name; unlinking a missing name is
            // harmless; SEM_FAILED is checked below.
            let sem = unsafe {
                libc::sem_unlink(c_name.as_ptr());
                libc::sem_open(
                    c_name.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL,
                    0o600 as libc::c_uint,
                    0 as libc::c_uint,
                )
            };
            if sem == libc::SEM_FAILED {
                return Err(TransportError::UnableToCreate(format!(
                    "sem_open({}) failed: {}",
                    name,
                    io::Error::last_os_error()
                )));
            }
            Ok(Self {
                sem,
                name: name.to_string(),
                owner: true,
            })
        }

        fn open(name: &str) -> Result<Self> {
            let c_name = std::ffi::CString::new(name)
                .map_err(|_| TransportError::UnableToCreate(format!("NUL in sem name {}", name)))?;
            // SAFETY: valid NUL-terminated name; SEM_FAILED is checked below.
            let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
            if sem == libc::SEM_FAILED {
                return Err(TransportError::NotFound(format!(
                    "semaphore {}: {}",
                    name,
                    io::Error::last_os_error()
                )));
            }
            Ok(Self {
                sem,
                name: name.to_string(),
                owner: false,
            })
        }

        fn post(&self) {
            // SAFETY: sem is a valid handle from sem_open.
            unsafe {
                libc::sem_post(self.sem);
            }
        }

        /// Wait for a post, bounded. Returns true when signaled.
        fn timedwait(&self, timeout: Duration) -> bool {
            let mut now = libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };
            // SAFETY: now is a valid timespec out-parameter.
            if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
                thread::sleep(timeout);
                return false;
            }
            let nanos = now.tv_nsec as i128 + i128::from(timeout.subsec_nanos());
            let deadline = libc::timespec {
                tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t
                    + (nanos / 1_000_000_000) as libc::time_t,
                tv_nsec: (nanos % 1_000_000_000) as libc::c_long,
            };
            // SAFETY: sem is valid and deadline is a fully initialized
            // absolute CLOCK_REALTIME timespec.
            let ret = unsafe { libc::sem_timedwait(self.sem, &deadline) };
            ret == 0
        }
    }

    impl Drop for NamedSemaphore {
        fn drop(&mut self) {
            // SAFETY: sem is a valid handle, closed exactly once here; only
            // the creator unlinks the name.
            unsafe {
                libc::sem_close(self.sem);
                if self.owner {
                    if let Ok(c_name) = std::ffi::CString::new(self.name.clone()) {
                        libc::sem_unlink(c_name.as_ptr());
                    }
                }
            }
        }
    }

    // ========================================================================
    // Record codec
    // ========================================================================

    fn encode_record(src: &str, bufs: &[IoSlice<'_>]) -> Vec<u8> {
        let payload_len: usize = bufs.iter().map(|b| b.len()).sum();
        let mut out = Vec::with_capacity(2 + src.len() + payload_len);
        out.extend_from_slice(&(src.len() as u16).to_be_bytes());
        out.extend_from_slice(src.as_bytes());
        for buf in bufs {
            out.extend_from_slice(buf);
        }
        out
    }

    fn decode_record(record: &[u8]) -> Option<(RemoteAddress, Vec<u8>)> {
        if record.len() < 2 {
            return None;
        }
        let src_len = u16::from_be_bytes([record[0], record[1]]) as usize;
        if record.len() < 2 + src_len {
            return None;
        }
        let src = std::str::from_utf8(&record[2..2 + src_len]).ok()?;
        let sep = src.find('\0')?;
        let (hostname, pool) = (&src[..sep], &src[sep + 1..]);
        if hostname.is_empty() || pool.is_empty() {
            return None;
        }
        Some((
            RemoteAddress::Shmem {
                hostname: hostname.to_string(),
                pool: pool.to_string(),
            },
            record[2 + src_len..].to_vec(),
        ))
    }

    // ========================================================================
    // Wire sender
    // ========================================================================

    struct ShmemWireSender {
        /// The peer's pool, mapped into this process.
        segment: ShmemSegment,
        sem: NamedSemaphore,
        /// `hostname \0 pool` of the local instance, stamped into records.
        src: String,
        max_message_size: usize,
    }

    impl WireSender for ShmemWireSender {
        fn send_bytes(&self, bufs: &[IoSlice<'_>], _backpressure: &mut bool) -> io::Result<usize> {
            let total: usize = bufs.iter().map(|b| b.len()).sum();
            if total > self.max_message_size {
                log::warn!(
                    "[SHM] dropping {}-byte record for {} (max {})",
                    total,
                    self.segment.name(),
                    self.max_message_size
                );
                return Ok(total);
            }

            let Some(ring) = ShmemRing::attach(&self.segment) else {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "peer pool not initialized",
                ));
            };
            let record = encode_record(&self.src, bufs);
            if ring.push(&record) {
                self.sem.post();
            } else {
                // Full pool behaves like a full datagram socket: best effort.
                log::debug!(
                    "[SHM] pool {} full, dropping {} bytes",
                    self.segment.name(),
                    total
                );
            }
            Ok(total)
        }
    }

    // ========================================================================
    // ShmemTransport
    // ========================================================================

    /// Shared-memory pool connection manager.
    pub struct ShmemTransport {
        inst: TransportInst,
        cfg: ShmemInst,
        local_key: RemoteAddress,
        segment: Arc<ShmemSegment>,
        sem: Arc<NamedSemaphore>,
        links: LinkTable,
        shutdown_flag: Arc<AtomicBool>,
        poller: Mutex<Option<JoinHandle<()>>>,
        shut_down: AtomicBool,
    }

    impl ShmemTransport {
        /// Create the receive pool and start the polling thread.
        ///
        /// Each step failing releases everything acquired before it
        /// (segment and semaphore drop handles the unlink), so partial
        /// state never persists.
        pub fn new(inst: &TransportInst) -> Result<Arc<Self>> {
            let cfg = inst.shmem()?.clone();
            if cfg.pool_size < RING_HEADER_LEN + 1024 {
                return Err(TransportError::ConfigurationConflict(format!(
                    "'{}': pool_size {} too small",
                    inst.name, cfg.pool_size
                )));
            }

            let hostname = local_hostname();
            let segment = ShmemSegment::create(&segment_name(&cfg.pool_name), cfg.pool_size)?;
            ShmemRing::init(&segment);
            let sem = NamedSemaphore::create(&semaphore_name(&cfg.pool_name))?;

            let transport = Arc::new(Self {
                inst: inst.clone(),
                local_key: RemoteAddress::Shmem {
                    hostname,
                    pool: cfg.pool_name.clone(),
                },
                cfg,
                segment: Arc::new(segment),
                sem: Arc::new(sem),
                links: LinkTable::new(),
                shutdown_flag: Arc::new(AtomicBool::new(false)),
                poller: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            });

            let handle = spawn_poller(&transport)?;
            *transport.poller.lock() = Some(handle);

            log::debug!("[SHM] '{}' pool {} ready", inst.name, transport.local_key);
            Ok(transport)
        }

        /// `hostname \0 pool` record source tag for this instance.
        fn src_tag(&self) -> String {
            match &self.local_key {
                RemoteAddress::Shmem { hostname, pool } => format!("{}\0{}", hostname, pool),
                _ => String::new(),
            }
        }

        fn local_hostname_matches(&self, hostname: &str) -> bool {
            matches!(&self.local_key, RemoteAddress::Shmem { hostname: local, .. } if local == hostname)
        }

        fn open_peer_wire(&self, pool: &str) -> Result<ShmemWireSender> {
            let segment = ShmemSegment::open(&segment_name(pool))?;
            let sem = NamedSemaphore::open(&semaphore_name(pool))?;
            Ok(ShmemWireSender {
                segment,
                sem,
                src: self.src_tag(),
                max_message_size: self.cfg.max_message_size,
            })
        }
    }

    fn spawn_poller(transport: &Arc<ShmemTransport>) -> Result<JoinHandle<()>> {
        let weak = Arc::downgrade(transport);
        let segment = Arc::clone(&transport.segment);
        let sem = Arc::clone(&transport.sem);
        let shutdown = Arc::clone(&transport.shutdown_flag);

        thread::Builder::new()
            .name("rdds-shm-poll".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    sem.timedwait(POLL_TIMEOUT);
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    let Some(ring) = ShmemRing::attach(&segment) else {
                        continue;
                    };
                    while let Some(record) = ring.pop() {
                        let Some((src, payload)) = decode_record(&record) else {
                            log::warn!("[SHM] malformed record ({} bytes)", record.len());
                            continue;
                        };
                        let Some(transport) = weak.upgrade() else {
                            return;
                        };
                        if let Some(link) = transport.links.get(&src) {
                            link.receive_strategy().deliver(&ReceivedDataSample {
                                remote: src,
                                source_prefix: None,
                                payload,
                            });
                        } else {
                            log::debug!("[SHM] record from unassociated peer {}", src);
                        }
                    }
                }
            })
            .map_err(|err| TransportError::UnableToCreate(format!("shm poller: {}", err)))
    }

    impl Transport for ShmemTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Shmem
        }

        fn inst(&self) -> &TransportInst {
            &self.inst
        }

        fn blob_to_key(&self, blob: &LocatorBlob) -> Option<RemoteAddress> {
            match blob.decode_expecting(&[LOCATOR_KIND_SHMEM])? {
                RemoteAddress::Shmem { hostname, pool } => {
                    if !self.local_hostname_matches(&hostname) {
                        // Pools on other hosts are structurally unreachable.
                        log::debug!("[SHM] ignoring locator for host '{}'", hostname);
                        return None;
                    }
                    Some(RemoteAddress::Shmem { hostname, pool })
                }
                _ => None,
            }
        }

        fn find_or_create_datalink(
            &self,
            blob: &LocatorBlob,
            _connect_as_publisher: bool,
        ) -> Result<Arc<DataLink>> {
            if self.shut_down.load(Ordering::Acquire) {
                return Err(TransportError::MiscProblem("transport is shut down".into()));
            }
            let key = key_or_not_found(self.kind(), self.blob_to_key(blob))?;
            let pool = match &key {
                RemoteAddress::Shmem { pool, .. } => pool.clone(),
                _ => unreachable!("blob_to_key returned a non-shmem key"),
            };

            let (link, created) =
                self.links.find_or_bind(key.clone(), || DataLink::new(key.clone()));
            if created {
                let wire = match self.open_peer_wire(&pool) {
                    Ok(wire) => Arc::new(wire),
                    Err(err) => {
                        release_link(&self.links, &link);
                        return Err(err);
                    }
                };
                // Pool writes never clog: no pause period.
                if let Err(err) = link.connect(wire, None) {
                    release_link(&self.links, &link);
                    return Err(err);
                }
            }
            Ok(link)
        }

        fn accept_datalink(&self, blob: &LocatorBlob, timeout: Duration) -> Result<Arc<DataLink>> {
            // Symmetric match: keep trying while the peer's pool appears.
            let deadline = Instant::now() + timeout;
            loop {
                match self.find_or_create_datalink(blob, false) {
                    Ok(link) => return Ok(link),
                    Err(TransportError::NotFound(reason)) => {
                        if Instant::now() >= deadline {
                            return Err(TransportError::UnableToCreate(format!(
                                "peer pool not available within {:?}: {}",
                                timeout, reason
                            )));
                        }
                        thread::sleep(ATTACH_RETRY);
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        fn release_datalink(&self, link: &Arc<DataLink>) {
            release_link(&self.links, link);
        }

        fn notify_lost_on_backpressure_timeout(&self) {
            mark_all_lost(&self.links);
        }

        fn shutdown(&self) {
            if self.shut_down.swap(true, Ordering::AcqRel) {
                return;
            }
            // Order matters: flag, wake the poller, join, then the segment
            // and semaphore fall with the transport.
            self.shutdown_flag.store(true, Ordering::Release);
            self.sem.post();
            if let Some(handle) = self.poller.lock().take() {
                let _ = handle.join();
            }
            for link in self.links.drain() {
                link.transport_shutdown();
            }
            log::debug!("[SHM] '{}' shut down", self.inst.name);
        }

        fn local_locator(&self) -> LocatorBlob {
            self.local_key.to_blob()
        }
    }

    impl Drop for ShmemTransport {
        fn drop(&mut self) {
            self.shutdown();
        }
    }

    // ========================================================================
    // Tests
    // ========================================================================

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::config::InstConfig;
        use crate::link::{LinkState, SendStatus};
        use crate::sample::DataSampleElement;
        use crate::strategy::recv::ReceiveListener;
        use std::sync::mpsc;

        fn inst(pool: &str) -> TransportInst {
            TransportInst::new(
                format!("shm_{}", pool),
                InstConfig::Shmem(ShmemInst {
                    pool_name: pool.to_string(),
                    pool_size: 64 * 1024,
                    ..Default::default()
                }),
            )
        }

        fn unique_pool(tag: &str) -> String {
            format!("{}_{}_{}", tag, std::process::id(), fastrand::u32(..))
        }

        struct Tx(std::sync::Mutex<mpsc::Sender<Vec<u8>>>);
        impl ReceiveListener for Tx {
            fn deliver_sample(&self, sample: &ReceivedDataSample) {
                let _ = self.0.lock().unwrap().send(sample.payload.clone());
            }
        }

        #[test]
        fn test_record_codec_round_trip() {
            let bufs = [IoSlice::new(b"payload")];
            let record = encode_record("host\0pool", &bufs);
            let (src, payload) = decode_record(&record).unwrap();
            assert_eq!(
                src,
                RemoteAddress::Shmem {
                    hostname: "host".to_string(),
                    pool: "pool".to_string()
                }
            );
            assert_eq!(payload, b"payload");
        }

        #[test]
        fn test_cross_host_blob_structurally_rejected() {
            let pool = unique_pool("xhost");
            let transport = ShmemTransport::new(&inst(&pool)).unwrap();

            let foreign = RemoteAddress::Shmem {
                hostname: "definitely-not-this-host".to_string(),
                pool: pool.clone(),
            }
            .to_blob();
            assert!(transport.blob_to_key(&foreign).is_none());
            assert!(matches!(
                transport.find_or_create_datalink(&foreign, true),
                Err(TransportError::NotFound(_))
            ));

            transport.shutdown();
        }

        #[test]
        fn test_same_host_pools_exchange_samples() {
            let pool_a = unique_pool("pa");
            let pool_b = unique_pool("pb");
            let a = ShmemTransport::new(&inst(&pool_a)).unwrap();
            let b = ShmemTransport::new(&inst(&pool_b)).unwrap();

            // Symmetric establishment by locator.
            let link_ab = a.find_or_create_datalink(&b.local_locator(), true).unwrap();
            let link_ba = b
                .accept_datalink(&a.local_locator(), Duration::from_secs(2))
                .unwrap();
            assert_eq!(link_ab.state(), LinkState::Connected);
            assert_eq!(link_ba.state(), LinkState::Connected);

            let (tx, rx) = mpsc::channel();
            link_ba
                .receive_strategy()
                .add_listener([1u8; 16], Arc::new(Tx(std::sync::Mutex::new(tx))));

            let element = DataSampleElement::new(1, 0, b"zero-copy-ish".to_vec());
            assert_eq!(link_ab.send(&element, None), SendStatus::Sent);
            assert_eq!(
                rx.recv_timeout(Duration::from_secs(2)).unwrap(),
                b"zero-copy-ish"
            );

            a.shutdown();
            b.shutdown();
        }

        #[test]
        fn test_connect_to_missing_pool_fails() {
            let pool = unique_pool("orphan");
            let transport = ShmemTransport::new(&inst(&pool)).unwrap();

            let ghost = RemoteAddress::Shmem {
                hostname: local_hostname(),
                pool: unique_pool("ghost"),
            }
            .to_blob();
            assert!(transport.find_or_create_datalink(&ghost, true).is_err());

            // accept_datalink keeps retrying, then gives up within bounds.
            let start = Instant::now();
            let err = transport
                .accept_datalink(&ghost, Duration::from_millis(200))
                .unwrap_err();
            assert!(matches!(err, TransportError::UnableToCreate(_)));
            assert!(start.elapsed() < Duration::from_secs(5));

            transport.shutdown();
        }

        #[test]
        fn test_shutdown_ordering_and_idempotence() {
            let pool = unique_pool("down");
            let transport = ShmemTransport::new(&inst(&pool)).unwrap();
            transport.shutdown();
            transport.shutdown();

            // The pool name is unlinked once the transport drops.
            let name = segment_name(&pool);
            drop(transport);
            assert!(ShmemSegment::open(&name).is_err());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_hostname_nonempty() {
        assert!(!local_hostname().is_empty());
    }

    #[test]
    fn test_sanitize_pool_name() {
        assert_eq!(sanitize_pool_name("my/pool name"), "my_pool_name");
        assert_eq!(sanitize_pool_name("plain123"), "plain123");
    }
}
