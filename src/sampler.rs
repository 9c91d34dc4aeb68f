use std::time::Instant;

use anyhow::Result;

use crate::retry::Clock;
use crate::sys::ResourceQuery;

const BYTES_PER_GIB: f64 = 1_073_741_824.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuSample {
    pub cpu_time_secs: f64,
    pub cpu_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySample {
    pub resident_gib: f64,
}

/// A sample either captured a value or found the process gone. The latter is
/// the caller's cue to reconcile lifecycle state, not an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleOutcome<T> {
    Sampled(T),
    NotRunning,
}

/// Turns cumulative CPU time into a utilization percentage by differencing
/// successive observations against wall-clock time.
pub struct ResourceSampler {
    virtualized_host: bool,
    baseline: Option<(f64, Instant)>,
}

impl ResourceSampler {
    pub fn new(virtualized_host: bool) -> Self {
        Self {
            virtualized_host,
            baseline: None,
        }
    }

    /// Forget the baseline; the next CPU sample reports 0% and re-seeds.
    pub fn reset(&mut self) {
        self.baseline = None;
    }

    pub fn sample_cpu(
        &mut self,
        pid: Option<u32>,
        query: &mut dyn ResourceQuery,
        clock: &dyn Clock,
    ) -> Result<SampleOutcome<CpuSample>> {
        let Some(pid) = pid else {
            return Ok(SampleOutcome::NotRunning);
        };
        let Some(cpu_time_secs) = query.cpu_time_secs(pid)? else {
            return Ok(SampleOutcome::NotRunning);
        };

        let now = clock.now();
        let cores = query.core_count().max(1) as f64;
        let cpu_percent = match self.baseline {
            Some((previous_secs, previous_at)) => {
                let wall = now.duration_since(previous_at).as_secs_f64();
                if wall > 0.0 {
                    let mut percent =
                        ((cpu_time_secs - previous_secs) / (wall * cores)) * 100.0;
                    if self.virtualized_host {
                        // Hypervisors overreport per-core time by the core count.
                        percent /= cores;
                    }
                    round2(percent.max(0.0))
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.baseline = Some((cpu_time_secs, now));

        Ok(SampleOutcome::Sampled(CpuSample {
            cpu_time_secs,
            cpu_percent,
        }))
    }

    pub fn sample_memory(
        &mut self,
        pid: Option<u32>,
        query: &mut dyn ResourceQuery,
    ) -> Result<SampleOutcome<MemorySample>> {
        let Some(pid) = pid else {
            return Ok(SampleOutcome::NotRunning);
        };
        let Some(bytes) = query.memory_bytes(pid)? else {
            return Ok(SampleOutcome::NotRunning);
        };

        Ok(SampleOutcome::Sampled(MemorySample {
            resident_gib: round2(bytes as f64 / BYTES_PER_GIB),
        }))
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
