use crate::clock::Clock;
use std::sync::Arc;
use std::time::Duration;

/// Supervision state of one encoder process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    /// Spawned, no progress output seen yet
    Starting,
    /// Progress heartbeats arriving
    Running,
    /// Heartbeats stopped mid-stream
    Stalled,
    /// Never produced a heartbeat within the start timeout
    TimedOut,
    /// Encoder reported `progress=end`
    Completed,
    Failed,
}

impl WatchdogState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WatchdogState::TimedOut | WatchdogState::Completed | WatchdogState::Failed
        )
    }

    /// The monitor must tear the process down in this state
    pub fn wants_teardown(&self) -> bool {
        matches!(self, WatchdogState::TimedOut | WatchdogState::Stalled)
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Max time from spawn to the first heartbeat
    pub start_timeout: Duration,
    /// Max gap between heartbeats once running
    pub stall_timeout: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(15),
            stall_timeout: Duration::from_secs(30),
        }
    }
}

/// Progress supervisor: turns "no heartbeat within N seconds" into an
/// explicit state transition the monitor acts on.
pub struct Watchdog {
    cfg: WatchdogConfig,
    clock: Arc<dyn Clock>,
    state: WatchdogState,
    last_heartbeat: Duration,
}

impl Watchdog {
    pub fn new(cfg: WatchdogConfig, clock: Arc<dyn Clock>) -> Self {
        let last_heartbeat = clock.monotonic();
        Self {
            cfg,
            clock,
            state: WatchdogState::Starting,
            last_heartbeat,
        }
    }

    pub fn state(&self) -> WatchdogState {
        self.state
    }

    /// Feed one stderr line; progress keys count as heartbeats
    pub fn observe_line(&mut self, line: &str) {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("progress=") {
            if value == "end" {
                if !self.state.is_terminal() {
                    self.state = WatchdogState::Completed;
                }
                return;
            }
            self.heartbeat();
        } else if line.starts_with("out_time_ms=") || line.starts_with("total_size=") {
            self.heartbeat();
        }
    }

    pub fn heartbeat(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.last_heartbeat = self.clock.monotonic();
        self.state = WatchdogState::Running;
    }

    /// Re-evaluate timeouts; returns the (possibly new) state
    pub fn tick(&mut self) -> WatchdogState {
        if self.state.is_terminal() {
            return self.state;
        }
        let silent_for = self.clock.monotonic().saturating_sub(self.last_heartbeat);
        match self.state {
            WatchdogState::Starting if silent_for >= self.cfg.start_timeout => {
                self.state = WatchdogState::TimedOut;
            }
            WatchdogState::Running if silent_for >= self.cfg.stall_timeout => {
                self.state = WatchdogState::Stalled;
            }
            _ => {}
        }
        self.state
    }

    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = WatchdogState::Failed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn watchdog(start_secs: u64, stall_secs: u64) -> (Watchdog, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let wd = Watchdog::new(
            WatchdogConfig {
                start_timeout: Duration::from_secs(start_secs),
                stall_timeout: Duration::from_secs(stall_secs),
            },
            clock.clone(),
        );
        (wd, clock)
    }

    #[test]
    fn times_out_without_first_heartbeat() {
        let (mut wd, clock) = watchdog(10, 30);
        clock.advance(Duration::from_secs(9));
        assert_eq!(wd.tick(), WatchdogState::Starting);
        clock.advance(Duration::from_secs(1));
        assert_eq!(wd.tick(), WatchdogState::TimedOut);
        assert!(wd.state().wants_teardown());
    }

    #[test]
    fn progress_lines_move_to_running() {
        let (mut wd, clock) = watchdog(10, 30);
        clock.advance(Duration::from_secs(5));
        wd.observe_line("out_time_ms=1240000");
        assert_eq!(wd.state(), WatchdogState::Running);
        clock.advance(Duration::from_secs(29));
        wd.observe_line("total_size=1048576");
        clock.advance(Duration::from_secs(29));
        assert_eq!(wd.tick(), WatchdogState::Running);
    }

    #[test]
    fn stalls_when_heartbeats_stop() {
        let (mut wd, clock) = watchdog(10, 30);
        wd.observe_line("progress=continue");
        clock.advance(Duration::from_secs(30));
        assert_eq!(wd.tick(), WatchdogState::Stalled);
        assert!(wd.state().wants_teardown());
    }

    #[test]
    fn progress_end_completes() {
        let (mut wd, _) = watchdog(10, 30);
        wd.observe_line("out_time_ms=5000000");
        wd.observe_line("progress=end");
        assert_eq!(wd.state(), WatchdogState::Completed);
        // Terminal states hold
        wd.observe_line("out_time_ms=6000000");
        assert_eq!(wd.tick(), WatchdogState::Completed);
    }

    #[test]
    fn non_progress_noise_is_ignored() {
        let (mut wd, clock) = watchdog(10, 30);
        wd.observe_line("[hls @ 0x55] Opening 'seg_000001.ts' for writing");
        clock.advance(Duration::from_secs(10));
        assert_eq!(wd.tick(), WatchdogState::TimedOut);
    }
}
