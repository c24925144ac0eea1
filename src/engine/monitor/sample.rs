use std::{
    io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    pub total_kb: u64,
    pub available_kb: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CpuStats {
    /// `None` on the first sample; usage needs two readings.
    pub usage_percent: Option<f64>,
    pub cores: u64,
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiskStats {
    pub path: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub used_percent: f64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub inode_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessStats {
    pub count: u64,
    pub open_files: u64,
}

/// Host-wide counters captured on one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub taken_at: DateTime<Utc>,
    pub memory: MemoryStats,
    pub cpu: CpuStats,
    pub disk: Option<DiskStats>,
    pub network: NetworkStats,
    pub processes: ProcessStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CpuTimes {
    total: u64,
    idle: u64,
}

impl CpuTimes {
    fn usage_since(&self, earlier: &CpuTimes) -> Option<f64> {
        let total = self.total.checked_sub(earlier.total)?;
        let idle = self.idle.checked_sub(earlier.idle)?;
        if total == 0 {
            return None;
        }
        Some(total.saturating_sub(idle) as f64 * 100.0 / total as f64)
    }
}

/// Reads `/proc`-style files under a configurable root.
pub struct Sampler {
    proc_root: PathBuf,
    disk_path: PathBuf,
    previous_cpu: Mutex<Option<CpuTimes>>,
}

impl Sampler {
    pub fn new(proc_root: PathBuf, disk_path: PathBuf) -> Self {
        Self {
            proc_root,
            disk_path,
            previous_cpu: Mutex::new(None),
        }
    }

    pub async fn sample(&self) -> io::Result<ResourceSnapshot> {
        let meminfo = self.read("meminfo").await?;
        let memory = parse_meminfo(&meminfo)
            .ok_or_else(|| invalid_data("meminfo has no MemTotal"))?;

        let stat = self.read("stat").await?;
        let times = parse_cpu_times(&stat).ok_or_else(|| invalid_data("stat has no cpu line"))?;
        let usage_percent = {
            let mut previous = self.previous_cpu.lock().await;
            let usage = previous.as_ref().and_then(|earlier| times.usage_since(earlier));
            *previous = Some(times);
            usage
        };
        let (load1, load5, load15) = parse_loadavg(&self.read("loadavg").await?)
            .ok_or_else(|| invalid_data("malformed loadavg"))?;
        let cpu = CpuStats {
            usage_percent,
            cores: count_cores(&stat).max(1),
            load1,
            load5,
            load15,
        };

        let network = match self.read("net/dev").await {
            Ok(raw) => parse_net_dev(&raw),
            Err(err) => {
                debug!(error = %err, "network counters unavailable");
                NetworkStats::default()
            }
        };

        let open_files = match self.read("sys/fs/file-nr").await {
            Ok(raw) => parse_file_nr(&raw).unwrap_or_default(),
            Err(_) => 0,
        };
        let processes = ProcessStats {
            count: count_processes(&self.proc_root).await?,
            open_files,
        };

        let disk = match disk_stats(&self.disk_path) {
            Ok(disk) => Some(disk),
            Err(err) => {
                debug!(path = %self.disk_path.display(), error = %err, "statvfs failed");
                None
            }
        };

        Ok(ResourceSnapshot {
            taken_at: Utc::now(),
            memory,
            cpu,
            disk,
            network,
            processes,
        })
    }

    async fn read(&self, name: &str) -> io::Result<String> {
        tokio::fs::read_to_string(self.proc_root.join(name)).await
    }
}

fn invalid_data(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

pub(crate) fn parse_meminfo(raw: &str) -> Option<MemoryStats> {
    let field = |key: &str| {
        raw.lines().find_map(|line| {
            let rest = line.strip_prefix(key)?.strip_prefix(':')?;
            rest.split_whitespace().next()?.parse::<u64>().ok()
        })
    };
    let total_kb = field("MemTotal")?;
    let available_kb = field("MemAvailable").unwrap_or_else(|| {
        field("MemFree").unwrap_or(0) + field("Buffers").unwrap_or(0) + field("Cached").unwrap_or(0)
    });
    let used_percent = if total_kb == 0 {
        0.0
    } else {
        total_kb.saturating_sub(available_kb) as f64 * 100.0 / total_kb as f64
    };
    Some(MemoryStats {
        total_kb,
        available_kb,
        used_percent,
    })
}

/// Aggregate `cpu` line: user nice system idle iowait irq softirq steal.
pub(crate) fn parse_cpu_times(raw: &str) -> Option<CpuTimes> {
    let line = raw.lines().find(|line| line.starts_with("cpu "))?;
    let fields = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|v| v.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        total: fields.iter().sum(),
        idle,
    })
}

fn count_cores(raw: &str) -> u64 {
    raw.lines()
        .filter(|line| {
            line.strip_prefix("cpu")
                .and_then(|rest| rest.chars().next())
                .is_some_and(|c| c.is_ascii_digit())
        })
        .count() as u64
}

pub(crate) fn parse_loadavg(raw: &str) -> Option<(f64, f64, f64)> {
    let mut parts = raw.split_whitespace().map(|v| v.parse::<f64>().ok());
    Some((parts.next()??, parts.next()??, parts.next()??))
}

/// Sums every interface except loopback.
pub(crate) fn parse_net_dev(raw: &str) -> NetworkStats {
    let mut stats = NetworkStats::default();
    for line in raw.lines().skip(2) {
        let Some((iface, counters)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            continue;
        }
        let values: Vec<u64> = counters
            .split_whitespace()
            .map(|v| v.parse().unwrap_or(0))
            .collect();
        if values.len() < 10 {
            continue;
        }
        stats.rx_bytes += values[0];
        stats.rx_packets += values[1];
        stats.tx_bytes += values[8];
        stats.tx_packets += values[9];
    }
    stats
}

pub(crate) fn parse_file_nr(raw: &str) -> Option<u64> {
    raw.split_whitespace().next()?.parse().ok()
}

async fn count_processes(proc_root: &Path) -> io::Result<u64> {
    let mut entries = tokio::fs::read_dir(proc_root).await?;
    let mut count = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if name
            .to_str()
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        {
            count += 1;
        }
    }
    Ok(count)
}

fn disk_stats(path: &Path) -> nix::Result<DiskStats> {
    let vfs = nix::sys::statvfs::statvfs(path)?;
    let fragment = u64::from(vfs.fragment_size());
    let blocks = u64::from(vfs.blocks());
    let free = u64::from(vfs.blocks_available());
    let inodes = u64::from(vfs.files());
    let free_inodes = u64::from(vfs.files_free());
    let percent = |total: u64, left: u64| {
        if total == 0 {
            0.0
        } else {
            total.saturating_sub(left) as f64 * 100.0 / total as f64
        }
    };
    Ok(DiskStats {
        path: path.display().to_string(),
        total_bytes: blocks.saturating_mul(fragment),
        free_bytes: free.saturating_mul(fragment),
        used_percent: percent(blocks, free),
        total_inodes: inodes,
        free_inodes,
        inode_percent: percent(inodes, free_inodes),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const STAT: &str = "cpu  100 0 100 700 100 0 0 0 0 0\n\
cpu0 50 0 50 350 50 0 0 0 0 0\n\
cpu1 50 0 50 350 50 0 0 0 0 0\n\
intr 12345\n";

    const NET_DEV: &str = "Inter-|   Receive                            |  Transmit\n \
face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n    \
lo: 5000 50 0 0 0 0 0 0 5000 50 0 0 0 0 0 0\n  \
eth0: 1000 10 0 0 0 0 0 0 2000 20 0 0 0 0 0 0\n  \
eth1: 500 5 0 0 0 0 0 0 700 7 0 0 0 0 0 0\n";

    /// Lays out a minimal fake proc tree.
    pub(crate) fn fake_proc(root: &Path, mem_available_kb: u64) {
        std::fs::create_dir_all(root.join("net")).unwrap();
        std::fs::create_dir_all(root.join("sys/fs")).unwrap();
        std::fs::write(
            root.join("meminfo"),
            format!(
                "MemTotal:        1000000 kB\nMemFree:          100000 kB\nMemAvailable:   {mem_available_kb} kB\n"
            ),
        )
        .unwrap();
        std::fs::write(root.join("stat"), STAT).unwrap();
        std::fs::write(root.join("loadavg"), "0.50 0.40 0.30 1/200 999\n").unwrap();
        std::fs::write(root.join("net/dev"), NET_DEV).unwrap();
        std::fs::write(root.join("sys/fs/file-nr"), "1536\t0\t9223372036854775807\n").unwrap();
        for pid in ["1", "42", "4242"] {
            std::fs::create_dir_all(root.join(pid)).unwrap();
        }
        std::fs::create_dir_all(root.join("self-not-a-pid")).unwrap();
    }

    #[test]
    fn parses_meminfo_with_and_without_available() {
        let stats = parse_meminfo("MemTotal: 1000 kB\nMemAvailable: 250 kB\n").unwrap();
        assert_eq!(stats.available_kb, 250);
        assert!((stats.used_percent - 75.0).abs() < f64::EPSILON);

        let legacy =
            parse_meminfo("MemTotal: 1000 kB\nMemFree: 100 kB\nBuffers: 50 kB\nCached: 50 kB\n")
                .unwrap();
        assert_eq!(legacy.available_kb, 200);
        assert!(parse_meminfo("SwapTotal: 0 kB\n").is_none());
    }

    #[test]
    fn cpu_usage_comes_from_the_delta() {
        let first = parse_cpu_times(STAT).unwrap();
        assert_eq!(first.total, 1000);
        assert_eq!(first.idle, 800);
        assert_eq!(count_cores(STAT), 2);

        let later = parse_cpu_times("cpu  200 0 200 1400 200 0 0 0\n").unwrap();
        let usage = later.usage_since(&first).unwrap();
        assert!((usage - 20.0).abs() < 1e-9);
        assert!(first.usage_since(&first).is_none());
    }

    #[test]
    fn network_counters_skip_loopback() {
        let stats = parse_net_dev(NET_DEV);
        assert_eq!(stats.rx_bytes, 1500);
        assert_eq!(stats.tx_bytes, 2700);
        assert_eq!(stats.rx_packets, 15);
        assert_eq!(stats.tx_packets, 27);
    }

    #[test]
    fn small_parsers() {
        assert_eq!(parse_loadavg("1.00 0.50 0.25 2/100 7"), Some((1.0, 0.5, 0.25)));
        assert_eq!(parse_loadavg("garbage"), None);
        assert_eq!(parse_file_nr("1536\t0\t100\n"), Some(1536));
    }

    #[tokio::test]
    async fn samples_a_fake_proc_tree() {
        let proc_root = tempfile::tempdir().unwrap();
        let disk = tempfile::tempdir().unwrap();
        fake_proc(proc_root.path(), 400_000);

        let sampler = Sampler::new(proc_root.path().to_path_buf(), disk.path().to_path_buf());
        let snapshot = sampler.sample().await.unwrap();
        assert!((snapshot.memory.used_percent - 60.0).abs() < 1e-9);
        assert_eq!(snapshot.cpu.usage_percent, None);
        assert_eq!(snapshot.cpu.cores, 2);
        assert_eq!(snapshot.processes.count, 3);
        assert_eq!(snapshot.processes.open_files, 1536);
        assert_eq!(snapshot.network.rx_bytes, 1500);
        assert!(snapshot.disk.unwrap().total_bytes > 0);

        std::fs::write(proc_root.path().join("stat"), "cpu  200 0 200 1400 200 0 0 0\n").unwrap();
        let second = sampler.sample().await.unwrap();
        assert!(second.cpu.usage_percent.is_some());
    }

    #[tokio::test]
    async fn missing_meminfo_is_an_error() {
        let proc_root = tempfile::tempdir().unwrap();
        let sampler = Sampler::new(proc_root.path().to_path_buf(), proc_root.path().to_path_buf());
        assert!(sampler.sample().await.is_err());
    }
}
