use std::time::Instant;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};

use crate::{
    protocol::{Cpu, FrameStats, Memory, Stats},
    worker::WorkerStats,
};

/// Samples host and process metrics for the periodic `stats` frame.
///
/// Process CPU usage is a delta between two refreshes, so the first sample
/// after start reports zero load.
pub struct StatsCollector {
    system: System,
    pid: Option<Pid>,
    started: Instant,
    cores: u32,
}

impl StatsCollector {
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing().with_processes(ProcessRefreshKind::everything()),
        );

        Self {
            system,
            pid: sysinfo::get_current_pid().ok(),
            started: Instant::now(),
            cores: num_cpus(),
        }
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Combine a fresh host sample with player counts summed over workers.
    pub fn collect(&mut self, workers: WorkerStats) -> Stats {
        self.system.refresh_memory();

        let (used, allocated, cpu_percent) = match self.pid {
            Some(pid) => {
                self.system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                self.system
                    .process(pid)
                    .map(|p| (p.memory(), p.virtual_memory(), p.cpu_usage() as f64))
                    .unwrap_or_default()
            }
            None => (0, 0, 0.0),
        };

        let lavalink_load = (cpu_percent / 100.0 / self.cores as f64).clamp(0.0, 1.0);

        Stats {
            players: workers.players,
            playing_players: workers.playing_players,
            uptime: self.uptime_ms(),
            memory: Memory {
                reservable: self.system.total_memory(),
                used,
                free: self.system.available_memory(),
                allocated,
            },
            cpu: Cpu {
                cores: self.cores,
                system_load: System::load_average().one,
                lavalink_load,
            },
            frame_stats: FrameStats::default(),
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn num_cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_carry_worker_totals() {
        let mut collector = StatsCollector::new();
        let stats = collector.collect(WorkerStats {
            players: 3,
            playing_players: 2,
        });

        assert_eq!(stats.players, 3);
        assert_eq!(stats.playing_players, 2);
        assert!(stats.cpu.cores >= 1);
        assert!((0.0..=1.0).contains(&stats.cpu.lavalink_load));
        assert_eq!(stats.frame_stats, FrameStats::default());
    }
}
