//! Partition and host selection policies.
//!
//! Write-target selection is a closed set of strategies parsed from the
//! volume config; read-target selection helpers rank replica hosts by
//! latency, epoch or topology. Dispatch happens at the call site on the
//! enum, there is no runtime registration.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::warn;
use rand::Rng;

use crate::partition::DataPartition;

/// Strategy for picking the partition a new extent is allocated on.
#[derive(Debug)]
pub enum DpSelector {
    /// Uniform random over the writable set.
    Random,
    /// Random over the fastest `percent` of the writable set, ranked by
    /// running average write latency.
    KFaster {
        /// Share of the writable set considered "fast", in percent.
        percent: u32,
    },
    /// Round robin over the writable set.
    Ticket {
        /// Monotonic ticket counter.
        round: AtomicU64,
    },
}

/// Default share for the k-faster strategy.
const DEFAULT_KFASTER_PERCENT: u32 = 30;

impl DpSelector {
    /// Parse the `(name, parm)` pair from the volume view. Unknown names
    /// fall back to random selection.
    pub fn parse(name: &str, parm: &str) -> DpSelector {
        match name.to_ascii_lowercase().as_str() {
            "" | "default" | "random" => DpSelector::Random,
            "kfaster" => {
                let percent = parm.parse().unwrap_or(DEFAULT_KFASTER_PERCENT);
                if !(1..=100).contains(&percent) {
                    warn!("kfaster selector parm {parm:?} out of range, using default");
                    DpSelector::KFaster {
                        percent: DEFAULT_KFASTER_PERCENT,
                    }
                } else {
                    DpSelector::KFaster { percent }
                }
            }
            "ticket" | "roundrobin" => DpSelector::Ticket {
                round: AtomicU64::new(0),
            },
            other => {
                warn!("unknown partition selector {other:?}, using random");
                DpSelector::Random
            }
        }
    }

    /// Pick a candidate from `writable`, skipping partitions any of whose
    /// hosts appear in `exclude`. Returns `None` when every candidate is
    /// excluded; the caller then clears its exclusion set and retries.
    pub fn select(
        &self,
        writable: &[Arc<DataPartition>],
        exclude: &HashSet<String>,
    ) -> Option<Arc<DataPartition>> {
        let candidates: Vec<&Arc<DataPartition>> = writable
            .iter()
            .filter(|dp| !dp.hosts().iter().any(|h| exclude.contains(h)))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        match self {
            DpSelector::Random => {
                let idx = rand::rng().random_range(0..candidates.len());
                Some(candidates[idx].clone())
            }
            DpSelector::KFaster { percent } => {
                let mut ranked = candidates;
                ranked.sort_by_key(|dp| dp.avg_write_latency());
                let k = ((ranked.len() * *percent as usize).div_ceil(100)).max(1);
                let idx = rand::rng().random_range(0..k);
                Some(ranked[idx].clone())
            }
            DpSelector::Ticket { round } => {
                let n = round.fetch_add(1, Ordering::Relaxed) as usize;
                Some(candidates[n % candidates.len()].clone())
            }
        }
    }
}

/// Weighted-random host choice favoring the lowest measured read delay.
/// Hosts without a measurement weigh as the slowest measured host.
pub fn pick_lowest_delay(hosts: &[String], delays: &HashMap<String, Duration>) -> Option<String> {
    if hosts.is_empty() {
        return None;
    }
    let slowest = delays
        .values()
        .copied()
        .max()
        .unwrap_or(Duration::from_millis(1))
        .max(Duration::from_micros(1));
    // Weight inversely to delay, in slowest-relative units.
    let weights: Vec<u64> = hosts
        .iter()
        .map(|h| {
            let d = delays.get(h).copied().unwrap_or(slowest);
            let d = d.max(Duration::from_micros(1));
            (slowest.as_micros() as u64 * 100 / d.as_micros() as u64).max(1)
        })
        .collect();
    let total: u64 = weights.iter().sum();
    let mut roll = rand::rng().random_range(0..total);
    for (host, w) in hosts.iter().zip(&weights) {
        if roll < *w {
            return Some(host.clone());
        }
        roll -= w;
    }
    hosts.last().cloned()
}

/// Rotate `hosts` by the partition epoch so successive epochs spread reads
/// across replicas.
pub fn epoch_rotated(hosts: &[String], epoch: u64) -> Vec<String> {
    if hosts.is_empty() {
        return Vec::new();
    }
    let n = (epoch % hosts.len() as u64) as usize;
    let mut rotated = hosts[n..].to_vec();
    rotated.extend_from_slice(&hosts[..n]);
    rotated
}

/// Order hosts by distance from the local IP: same address, then same /24
/// network, then same /16, then the rest.
pub fn sort_by_distance(hosts: &[String], local_ip: &str) -> Vec<String> {
    fn octets(addr: &str) -> Vec<&str> {
        addr.split(':').next().unwrap_or("").split('.').collect()
    }
    let local = octets(local_ip);
    let mut ranked = hosts.to_vec();
    ranked.sort_by_key(|h| {
        let o = octets(h);
        let shared = local.iter().zip(&o).take_while(|(a, b)| a == b).count();
        std::cmp::Reverse(shared)
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{DataPartitionView, PartitionStatus};

    fn dp(id: u64, hosts: &[&str]) -> Arc<DataPartition> {
        let view = DataPartitionView {
            partition_id: id,
            status: PartitionStatus::ReadWrite,
            replica_num: hosts.len() as u8,
            hosts: hosts.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        Arc::new(DataPartition::from_view(&view, 0))
    }

    #[test]
    fn parse_falls_back_to_random() {
        assert!(matches!(DpSelector::parse("", ""), DpSelector::Random));
        assert!(matches!(
            DpSelector::parse("no-such-policy", ""),
            DpSelector::Random
        ));
        assert!(matches!(
            DpSelector::parse("kfaster", "250"),
            DpSelector::KFaster { percent: 30 }
        ));
        assert!(matches!(
            DpSelector::parse("kfaster", "50"),
            DpSelector::KFaster { percent: 50 }
        ));
    }

    #[test]
    fn exclusion_filters_by_host() {
        let writable = vec![dp(1, &["a:1"]), dp(2, &["b:1"])];
        let selector = DpSelector::Random;

        let mut exclude = HashSet::new();
        exclude.insert("a:1".to_string());
        for _ in 0..16 {
            let got = selector.select(&writable, &exclude).unwrap();
            assert_eq!(got.id, 2);
        }

        exclude.insert("b:1".to_string());
        assert!(selector.select(&writable, &exclude).is_none());
    }

    #[test]
    fn ticket_cycles() {
        let writable = vec![dp(1, &["a:1"]), dp(2, &["b:1"]), dp(3, &["c:1"])];
        let selector = DpSelector::parse("ticket", "");
        let picks: Vec<u64> = (0..6)
            .map(|_| selector.select(&writable, &HashSet::new()).unwrap().id)
            .collect();
        assert_eq!(picks, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn kfaster_prefers_fast_partitions() {
        let writable = vec![dp(1, &["a:1"]), dp(2, &["b:1"]), dp(3, &["c:1"])];
        writable[0].record_write(Duration::from_millis(50));
        writable[1].record_write(Duration::from_millis(1));
        writable[2].record_write(Duration::from_millis(60));

        let selector = DpSelector::parse("kfaster", "34");
        for _ in 0..16 {
            let got = selector.select(&writable, &HashSet::new()).unwrap();
            assert_eq!(got.id, 2);
        }
    }

    #[test]
    fn epoch_rotation() {
        let hosts: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(epoch_rotated(&hosts, 0), vec!["a", "b", "c"]);
        assert_eq!(epoch_rotated(&hosts, 1), vec!["b", "c", "a"]);
        assert_eq!(epoch_rotated(&hosts, 5), vec!["c", "a", "b"]);
    }

    #[test]
    fn distance_sort() {
        let hosts: Vec<String> = ["10.1.2.3:17030", "10.1.9.9:17030", "172.16.0.1:17030"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let ranked = sort_by_distance(&hosts, "10.1.2.99");
        assert_eq!(ranked[0], "10.1.2.3:17030");
        assert_eq!(ranked[1], "10.1.9.9:17030");
        assert_eq!(ranked[2], "172.16.0.1:17030");
    }

    #[test]
    fn lowest_delay_prefers_fastest() {
        let hosts: Vec<String> = ["a:1", "b:1"].iter().map(|s| s.to_string()).collect();
        let mut delays = HashMap::new();
        delays.insert("a:1".to_string(), Duration::from_micros(10));
        delays.insert("b:1".to_string(), Duration::from_millis(100));

        let mut a = 0;
        for _ in 0..200 {
            if pick_lowest_delay(&hosts, &delays).as_deref() == Some("a:1") {
                a += 1;
            }
        }
        assert!(a > 150, "fast host won only {a}/200 rolls");
    }
}
