// Frame timing - rolling statistics over the last N frames
//
// Each frame is split into three phases: waiting for the frame slot,
// per-view rendering (acquire through release), and the end-of-frame
// submit. The budget follows the runtime's predicted display period, so a
// refresh-rate change moves the miss threshold with it.

use std::collections::VecDeque;
use std::time::Duration;

const DEFAULT_WINDOW: usize = 1000;

#[derive(Debug, Clone, Copy, Default)]
pub struct FramePhases {
    pub wait: Duration,
    pub render: Duration,
    pub submit: Duration,
}

impl FramePhases {
    pub fn total(&self) -> Duration {
        self.wait + self.render + self.submit
    }
}

#[derive(Debug)]
pub struct FrameTiming {
    window: usize,
    wait_ms: VecDeque<f64>,
    render_ms: VecDeque<f64>,
    submit_ms: VecDeque<f64>,
    total_ms: VecDeque<f64>,
    budget: Duration,
    frames: u64,
    missed: u64,
}

impl Default for FrameTiming {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl FrameTiming {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            wait_ms: VecDeque::with_capacity(window),
            render_ms: VecDeque::with_capacity(window),
            submit_ms: VecDeque::with_capacity(window),
            total_ms: VecDeque::with_capacity(window),
            // 90 Hz until the runtime tells us otherwise
            budget: Duration::from_micros(11_111),
            frames: 0,
            missed: 0,
        }
    }

    /// Track the runtime's display period; ignored when the runtime reports zero.
    pub fn set_budget(&mut self, period: Duration) {
        if !period.is_zero() && period != self.budget {
            log::debug!("Frame budget now {:.2} ms", period.as_secs_f64() * 1000.0);
            self.budget = period;
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn record(&mut self, phases: FramePhases) {
        let window = self.window;
        let push = |samples: &mut VecDeque<f64>, value: Duration| {
            if samples.len() == window {
                samples.pop_front();
            }
            samples.push_back(value.as_secs_f64() * 1000.0);
        };

        push(&mut self.wait_ms, phases.wait);
        push(&mut self.render_ms, phases.render);
        push(&mut self.submit_ms, phases.submit);
        push(&mut self.total_ms, phases.total());

        self.frames += 1;
        if phases.total() > self.budget {
            self.missed += 1;
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn missed(&self) -> u64 {
        self.missed
    }

    pub fn samples(&self) -> usize {
        self.total_ms.len()
    }

    pub fn stats(&self) -> FrameStats {
        let wait = sorted(&self.wait_ms);
        let render = sorted(&self.render_ms);
        let submit = sorted(&self.submit_ms);
        let total = sorted(&self.total_ms);

        let total_p50 = percentile(&total, 50.0);
        FrameStats {
            wait_p50: percentile(&wait, 50.0),
            render_p50: percentile(&render, 50.0),
            render_p99: percentile(&render, 99.0),
            submit_p50: percentile(&submit, 50.0),
            total_p50,
            total_p99: percentile(&total, 99.0),
            fps: if total_p50 > 0.0 { 1000.0 / total_p50 } else { 0.0 },
            missed_pct: if self.frames > 0 {
                self.missed as f64 * 100.0 / self.frames as f64
            } else {
                0.0
            },
            frames: self.frames,
            missed: self.missed,
        }
    }

    pub fn log_summary(&self) {
        if self.frames == 0 {
            return;
        }
        let s = self.stats();
        log::info!(
            "Frames: {} | total p50 {:.2} ms p99 {:.2} ms | wait {:.2} render {:.2} submit {:.2} | missed {} ({:.1}%)",
            s.frames,
            s.total_p50,
            s.total_p99,
            s.wait_p50,
            s.render_p50,
            s.submit_p50,
            s.missed,
            s.missed_pct
        );
    }
}

/// Percentiles in milliseconds over the current window.
#[derive(Debug, Clone, Copy)]
pub struct FrameStats {
    pub wait_p50: f64,
    pub render_p50: f64,
    pub render_p99: f64,
    pub submit_p50: f64,
    pub total_p50: f64,
    pub total_p99: f64,
    pub fps: f64,
    pub missed_pct: f64,
    pub frames: u64,
    pub missed: u64,
}

fn sorted(samples: &VecDeque<f64>) -> Vec<f64> {
    let mut values: Vec<f64> = samples.iter().copied().collect();
    values.sort_by(|a, b| a.total_cmp(b));
    values
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p / 100.0).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}
