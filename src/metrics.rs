// src/metrics.rs
//
// Host utilization sampling for the on-frame overlay, plus session counters
// reported when the pipeline closes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use sysinfo::System;

/// Point-in-time host utilization, rendered onto every frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub cpu_percent: f32,
    pub mem_percent: f32,
}

/// Samples CPU and memory utilization from the host. CPU usage is computed
/// against the previous refresh, so the very first snapshot reads 0.
pub struct SystemSampler {
    system: System,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self { system }
    }

    pub fn snapshot(&mut self) -> MetricsSnapshot {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let cpu_percent = self.system.global_cpu_info().cpu_usage();
        let total = self.system.total_memory();
        let mem_percent = if total == 0 {
            0.0
        } else {
            self.system.used_memory() as f32 / total as f32 * 100.0
        };

        MetricsSnapshot {
            cpu_percent,
            mem_percent,
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Session counters. Updated from the single control thread; atomics keep the
/// update sites uniform and the struct shareable if a reporter ever needs it.
#[derive(Debug)]
pub struct PipelineMetrics {
    pub frames_captured: AtomicU64,
    pub frames_pushed: AtomicU64,
    pub frames_degraded: AtomicU64,
    pub started_at: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            frames_captured: AtomicU64::new(0),
            frames_pushed: AtomicU64::new(0),
            frames_degraded: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        let frames = self.frames_pushed.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_pushed: self.frames_pushed.load(Ordering::Relaxed),
            frames_degraded: self.frames_degraded.load(Ordering::Relaxed),
            avg_fps: self.fps(),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsSummary {
    pub frames_captured: u64,
    pub frames_pushed: u64,
    pub frames_degraded: u64,
    pub avg_fps: f64,
    pub elapsed_secs: f64,
}
