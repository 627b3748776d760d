use std::time::Instant;

use common::config::statistics::REPORT_INTERVAL;

use crate::executor::ExitReason;

#[derive(Debug)]
pub struct Statistics {
    start: Instant,
    last_report: Instant,
    executions: u64,
    executions_at_report: u64,
    crashes: u64,
    timeouts: u64,
    hangs: u64,
}

impl Statistics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_report: now,
            executions: 0,
            executions_at_report: 0,
            crashes: 0,
            timeouts: 0,
            hangs: 0,
        }
    }

    pub fn process_execution(&mut self, exit_reason: ExitReason) {
        self.executions += 1;
        match exit_reason {
            ExitReason::Normal => {}
            ExitReason::Timeout => self.timeouts += 1,
            ExitReason::Crash => self.crashes += 1,
            ExitReason::Hang => self.hangs += 1,
        }
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    pub fn maybe_report(&mut self, queue_len: usize, indexed_bits: usize, chunks: usize) {
        let elapsed = self.last_report.elapsed();
        if elapsed < REPORT_INTERVAL {
            return;
        }

        let interval_execs = self.executions - self.executions_at_report;
        log::info!(
            "{:>10} execs ({:>6.0}/s), {:>5} queue entries, {:>6} coverage bits, {:>6} chunks, {} crashes, {} timeouts, {} hangs [up {}s]",
            self.executions,
            interval_execs as f64 / elapsed.as_secs_f64(),
            queue_len,
            indexed_bits,
            chunks,
            self.crashes,
            self.timeouts,
            self.hangs,
            self.start.elapsed().as_secs(),
        );

        self.last_report = Instant::now();
        self.executions_at_report = self.executions;
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}
