//! Cross-process TCP port reservation.
//!
//! Local availability is probed by binding and immediately releasing a
//! listener; remote availability by running a netstat-equivalent through the
//! session's remote-execution command and parsing the output. Reservations
//! are coordinated across workstation processes through a file-backed bitmap
//! mapped into shared memory, guarded by an advisory lock with a stamp field
//! that lets a stale holder be reclaimed.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::net::TcpListener;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use memmap2::MmapMut;
use tracing::{debug, warn};

use cdcsync_core::{Error, Result};

use crate::supervisor::ProcessFactory;

/// How long to wait for the reservation lock before declaring the holder
/// stale
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Bitmap header: magic (4) + holder stamp millis (8)
const HEADER_LEN: usize = 12;
const MAGIC: u32 = 0x6364_7370; // "cdsp"

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub first: u16,
    pub last: u16,
}

impl PortRange {
    #[must_use]
    pub fn len(&self) -> usize {
        (self.last - self.first) as usize + 1
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last < self.first
    }
}

/// Remote-side availability probe
pub struct RemoteProbe<'a> {
    pub factory: &'a dyn ProcessFactory,
    /// Pre-templated remote-execution prefix
    pub ssh_cmd: &'a str,
    /// Address remote listeners are matched against
    pub ip: &'a str,
    pub timeout: Duration,
}

impl RemoteProbe<'_> {
    /// Ports in `range` that are busy on the instance
    ///
    /// # Errors
    /// Returns `DeadlineExceeded` when the remote command times out
    fn busy_ports(&self, range: PortRange) -> Result<HashSet<u16>> {
        let output = self
            .factory
            .run(&format!("{} netstat -tln", self.ssh_cmd), self.timeout)?;
        if !output.success() {
            return Err(Error::unavailable(format!(
                "remote netstat failed: {}",
                output.stderr_tail()
            )));
        }
        Ok(parse_netstat(&output.stdout, self.ip, range))
    }
}

/// Extract the listening ports within `range` bound to `ip` (or any address)
/// from netstat/ss-style output.
#[must_use]
pub fn parse_netstat(output: &str, ip: &str, range: PortRange) -> HashSet<u16> {
    let mut busy = HashSet::new();
    for line in output.lines() {
        if !line.contains("LISTEN") {
            continue;
        }
        // The local-address column is the first token of the form addr:port.
        for token in line.split_whitespace() {
            let Some((addr, port_str)) = token.rsplit_once(':') else {
                continue;
            };
            let Ok(port) = port_str.parse::<u16>() else {
                continue;
            };
            let addr_matches =
                addr == ip || addr == "0.0.0.0" || addr == "*" || addr == "::" || addr == "[::]";
            if addr_matches && port >= range.first && port <= range.last {
                busy.insert(port);
            }
            break;
        }
    }
    busy
}

/// Whether a local port can currently be bound
fn local_port_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// File-backed reservation bitmap shared by every manager process using the
/// same segment name.
struct SharedBitmap {
    file: File,
}

impl SharedBitmap {
    fn open(segment_name: &str, range: PortRange) -> Result<Self> {
        let path: PathBuf = std::env::temp_dir().join(format!("{segment_name}.ports"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.set_len((HEADER_LEN + range.len().div_ceil(8)) as u64)?;
        Ok(Self { file })
    }

    /// Run `f` over the bitmap bits under the cross-process lock.
    ///
    /// A dead holder releases the flock with its process, so the stale-stamp
    /// path only fires for a holder that is alive but hung past
    /// `LOCK_TIMEOUT`. That holder gets one more non-blocking chance to have
    /// let go; if it still holds the flock, the call proceeds unserialized
    /// against it (logged loudly) rather than wedging every reservation.
    fn with_lock<T>(&self, f: impl FnOnce(&mut [u8]) -> T) -> Result<T> {
        let deadline = Instant::now() + LOCK_TIMEOUT;
        let locked = loop {
            match self.file.try_lock_exclusive() {
                Ok(()) => break true,
                Err(_) => {
                    let stamp = self.read_stamp().unwrap_or(0);
                    if stamp != 0 && now_millis().saturating_sub(stamp) > LOCK_TIMEOUT.as_millis() as u64 {
                        warn!("port-reservation lock holder stale, reclaiming");
                        break self.file.try_lock_exclusive().is_ok();
                    }
                    if Instant::now() >= deadline {
                        return Err(Error::deadline_exceeded("port reservation lock"));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        };
        if !locked {
            warn!("updating port-reservation bitmap without the lock");
        }

        let result = (|| {
            let mut map = unsafe { MmapMut::map_mut(&self.file) }?;
            map[..4].copy_from_slice(&MAGIC.to_be_bytes());
            map[4..HEADER_LEN].copy_from_slice(&now_millis().to_be_bytes());
            let value = f(&mut map[HEADER_LEN..]);
            map[4..HEADER_LEN].copy_from_slice(&0u64.to_be_bytes());
            map.flush()?;
            Ok(value)
        })();
        if locked {
            let _ = fs2::FileExt::unlock(&self.file);
        }
        result
    }

    fn read_stamp(&self) -> Result<u64> {
        let map = unsafe { MmapMut::map_mut(&self.file) }?;
        let mut stamp = [0u8; 8];
        stamp.copy_from_slice(&map[4..HEADER_LEN]);
        Ok(u64::from_be_bytes(stamp))
    }
}

/// Reserves ports in a configured range, coordinating with other processes
/// on the workstation and optionally checking the remote instance.
pub struct PortManager {
    bitmap: SharedBitmap,
    range: PortRange,
    reserved: HashSet<u16>,
}

impl PortManager {
    /// `segment_name` must be identical across every process sharing the
    /// range.
    ///
    /// # Errors
    /// Returns an error when the shared segment cannot be created
    pub fn new(segment_name: &str, range: PortRange) -> Result<Self> {
        if range.is_empty() {
            return Err(Error::invalid_argument("empty port range"));
        }
        Ok(Self {
            bitmap: SharedBitmap::open(segment_name, range)?,
            range,
            reserved: HashSet::new(),
        })
    }

    /// Reserve a port that is free locally, unclaimed by any cooperating
    /// process, and (when `remote` is given) free on the instance.
    ///
    /// # Errors
    /// `ResourceExhausted` when the range is used up, `DeadlineExceeded`
    /// when the remote probe times out
    pub fn reserve(&mut self, remote: Option<&RemoteProbe<'_>>) -> Result<u16> {
        let remote_busy = match remote {
            Some(probe) => probe.busy_ports(self.range)?,
            None => HashSet::new(),
        };

        let range = self.range;
        let picked = self.bitmap.with_lock(|bits| {
            for port in range.first..=range.last {
                let (byte, mask) = bit_for(range, port);
                if bits[byte] & mask != 0 {
                    continue;
                }
                if remote_busy.contains(&port) || !local_port_free(port) {
                    continue;
                }
                bits[byte] |= mask;
                return Some(port);
            }
            None
        })?;

        let port = picked.ok_or_else(|| {
            Error::resource_exhausted(format!(
                "no free port in {}..={}",
                self.range.first, self.range.last
            ))
        })?;
        debug!("reserved port {port}");
        self.reserved.insert(port);
        Ok(port)
    }

    /// Release one reservation
    ///
    /// # Errors
    /// Returns `NotFound` for a port this manager does not hold
    pub fn release(&mut self, port: u16) -> Result<()> {
        if !self.reserved.remove(&port) {
            return Err(Error::not_found(format!("port {port} not reserved here")));
        }
        let range = self.range;
        self.bitmap.with_lock(|bits| {
            let (byte, mask) = bit_for(range, port);
            bits[byte] &= !mask;
        })?;
        debug!("released port {port}");
        Ok(())
    }

    /// Re-assert this manager's reservations in the shared bitmap. A peer
    /// that forcibly reclaimed a stale lock may have flushed partial state;
    /// periodic reconciliation repairs the bits for ports we still hold.
    ///
    /// # Errors
    /// Propagates lock acquisition failures
    pub fn reconcile(&mut self) -> Result<()> {
        if self.reserved.is_empty() {
            return Ok(());
        }
        let range = self.range;
        let held: Vec<u16> = self.reserved.iter().copied().collect();
        self.bitmap.with_lock(|bits| {
            for port in held {
                let (byte, mask) = bit_for(range, port);
                bits[byte] |= mask;
            }
        })
    }

    /// Release everything this manager still holds
    pub fn release_all(&mut self) {
        let ports: Vec<u16> = self.reserved.iter().copied().collect();
        for port in ports {
            if let Err(err) = self.release(port) {
                warn!("releasing port {port}: {err}");
            }
        }
    }
}

impl Drop for PortManager {
    fn drop(&mut self) {
        self.release_all();
    }
}

fn bit_for(range: PortRange, port: u16) -> (usize, u8) {
    let index = (port - range.first) as usize;
    (index / 8, 1 << (index % 8))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_segment(tag: &str) -> String {
        format!("cdcsync-test-{tag}-{}", std::process::id())
    }

    const NETSTAT_SAMPLE: &str = "\
Active Internet connections (only servers)
Proto Recv-Q Send-Q Local Address           Foreign Address         State
tcp        0      0 127.0.0.1:45810         0.0.0.0:*               LISTEN
tcp        0      0 0.0.0.0:45812           0.0.0.0:*               LISTEN
tcp        0      0 127.0.0.1:22            0.0.0.0:*               LISTEN
tcp        0      0 10.0.0.5:45814          0.0.0.0:*               LISTEN
tcp6       0      0 :::45816                :::*                    LISTEN
tcp        0      0 127.0.0.1:45818         10.0.0.9:4242           ESTABLISHED
";

    #[test]
    fn test_parse_netstat_filters_by_ip_and_range() {
        let range = PortRange {
            first: 45810,
            last: 45819,
        };
        let busy = parse_netstat(NETSTAT_SAMPLE, "127.0.0.1", range);
        // 45810 matches the ip, 45812 and 45816 are wildcard binds, 45814 is
        // another address, 45818 is not LISTEN, 22 is out of range.
        assert_eq!(busy, HashSet::from([45810, 45812, 45816]));
    }

    #[test]
    fn test_parse_ss_style_output() {
        let range = PortRange {
            first: 4000,
            last: 4100,
        };
        let output = "LISTEN 0 128 127.0.0.1:4040 0.0.0.0:*\n";
        assert_eq!(parse_netstat(output, "127.0.0.1", range), HashSet::from([4040]));
    }

    #[test]
    fn test_reserve_release_cycle() {
        let range = PortRange {
            first: 49500,
            last: 49509,
        };
        let mut mgr = PortManager::new(&unique_segment("cycle"), range).unwrap();
        let port = mgr.reserve(None).unwrap();
        assert!(port >= range.first && port <= range.last);

        mgr.release(port).unwrap();
        assert!(mgr.release(port).is_err());
    }

    #[test]
    fn test_two_managers_never_collide() {
        let range = PortRange {
            first: 49520,
            last: 49527,
        };
        let segment = unique_segment("excl");
        let mut a = PortManager::new(&segment, range).unwrap();
        let mut b = PortManager::new(&segment, range).unwrap();

        let mut seen = HashSet::new();
        for _ in 0..4 {
            assert!(seen.insert(a.reserve(None).unwrap()));
            assert!(seen.insert(b.reserve(None).unwrap()));
        }
        assert_eq!(seen.len(), 8);
        assert!(matches!(
            a.reserve(None).unwrap_err().kind(),
            cdcsync_core::ErrorKind::ResourceExhausted
        ));
    }

    #[test]
    fn test_reservations_visible_across_instances() {
        let range = PortRange {
            first: 49540,
            last: 49541,
        };
        let segment = unique_segment("visible");
        let mut a = PortManager::new(&segment, range).unwrap();
        let first = a.reserve(None).unwrap();

        let mut b = PortManager::new(&segment, range).unwrap();
        let second = b.reserve(None).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_live_hung_holder_is_reclaimed() {
        let range = PortRange {
            first: 49570,
            last: 49571,
        };
        let segment = unique_segment("stale");

        // A holder that is alive (flock held) but hung: its stamp is far
        // past the timeout and never refreshed.
        let holder = SharedBitmap::open(&segment, range).unwrap();
        holder.file.try_lock_exclusive().unwrap();
        {
            let mut map = unsafe { MmapMut::map_mut(&holder.file) }.unwrap();
            map[4..HEADER_LEN].copy_from_slice(&1u64.to_be_bytes());
            map.flush().unwrap();
        }

        // The reclaim path completes instead of returning DeadlineExceeded,
        // and the mutation lands in the shared bitmap.
        let victim = SharedBitmap::open(&segment, range).unwrap();
        let seen = victim
            .with_lock(|bits| {
                bits[0] |= 0b1;
                bits[0]
            })
            .unwrap();
        assert_eq!(seen & 0b1, 0b1);

        let _ = fs2::FileExt::unlock(&holder.file);
        // With the holder gone, the bit written during reclaim is visible
        // under a normally acquired lock.
        let seen = victim.with_lock(|bits| bits[0]).unwrap();
        assert_eq!(seen & 0b1, 0b1);
    }

    #[test]
    fn test_reconcile_restores_bits() {
        let range = PortRange {
            first: 49560,
            last: 49561,
        };
        let segment = unique_segment("reconcile");
        let mut a = PortManager::new(&segment, range).unwrap();
        let port = a.reserve(None).unwrap();

        // Simulate a peer that wiped the bitmap after a forced reclaim.
        let b = PortManager::new(&segment, range).unwrap();
        b.bitmap.with_lock(|bits| bits.fill(0)).unwrap();

        a.reconcile().unwrap();
        let mut b = b;
        let other = b.reserve(None).unwrap();
        assert_ne!(other, port);
    }

    #[test]
    fn test_drop_releases() {
        let range = PortRange {
            first: 49550,
            last: 49550,
        };
        let segment = unique_segment("drop");
        {
            let mut a = PortManager::new(&segment, range).unwrap();
            a.reserve(None).unwrap();
        }
        let mut b = PortManager::new(&segment, range).unwrap();
        assert!(b.reserve(None).is_ok());
    }
}
