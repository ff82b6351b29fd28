//! Per-action timing and completion estimates
//!
//! The profiler tracks how long each stage of an action takes and projects a
//! running estimate of the total time, which feeds the status monitor's
//! progress callbacks. The estimate is advisory only — nothing in the
//! protocol depends on it.

use std::time::{Duration, Instant};

use crate::error::ErrorKind;
use crate::loader::Action;
use crate::protocol::INIT_BYTES;

/// Performance information about one loader action.
///
/// A summary is passed to
/// [StatusMonitor::loader_has_finished][crate::StatusMonitor::loader_has_finished].
/// Times are in floating point seconds.
#[derive(Debug, Default, Clone)]
pub struct ActionSummary {
    /// The action performed.
    pub action: Action,
    /// Whether the action succeeded.
    pub was_successful: bool,
    /// The kind of failure, if it did not.
    pub error_kind: ErrorKind,
    /// The baudrate used when performing the action.
    pub baudrate: u32,
    /// The reset duration used, in milliseconds.
    pub reset_duration_ms: u64,
    /// The boot wait duration used, in milliseconds.
    pub boot_wait_duration_ms: u64,
    /// The size of the image, in bytes.
    pub image_size: usize,
    /// The number of bytes needed to transmit the encoded image.
    pub encoded_image_size: usize,

    /// Sum of all stages.
    pub total_time: f32,
    /// Stage 1: preparation.
    pub stage1_time: f32,
    /// Stage 2: reset and boot wait (2a + 2b).
    pub stage2_time: f32,
    /// Stage 2a: reset.
    pub stage2a_time: f32,
    /// Stage 2b: boot wait.
    pub stage2b_time: f32,
    /// Stage 3: establish communications.
    pub stage3_time: f32,
    /// Stage 4: send command and image (4a + 4b).
    pub stage4_time: f32,
    /// Stage 4a: send command.
    pub stage4a_time: f32,
    /// Stage 4b: send image.
    ///
    /// Stage 5 actually begins while the tail of the image is still leaving
    /// the wire (all of it has been buffered), so this reads slightly short
    /// and `stage5_time` slightly long — by roughly the loader's early-return
    /// margin of 100 ms.
    pub stage4b_time: f32,
    /// Stage 5: wait for checksum status.
    pub stage5_time: f32,
    /// Stage 6: wait for EEPROM programming status.
    pub stage6_time: f32,
    /// Stage 7: wait for EEPROM verification status.
    pub stage7_time: f32,
    /// Image encoding time; encoding happens before stage 1.
    pub encoding_time: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Stage {
    Stage1,
    Stage2a,
    Stage2b,
    Stage3,
    Stage4a,
    Stage4b,
    Stage5,
    Stage6,
    Stage7,
    Finished,
}

/// Tracks the performance of an action as it runs.
///
/// The `end_*` functions must be called in stage order; either [end_ok] or
/// [end_with_error] closes the profile.
///
/// [end_ok]: Profiler::end_ok
/// [end_with_error]: Profiler::end_with_error
#[derive(Debug, Clone)]
pub(crate) struct Profiler {
    pub summary: ActionSummary,
    curr_stage: Stage,
    encoding_start: Instant,
    stage_start: Instant,
}

impl Profiler {
    pub fn new(
        action: Action,
        baudrate: u32,
        reset_duration: Duration,
        boot_wait_duration: Duration,
    ) -> Self {
        Profiler {
            summary: ActionSummary {
                action,
                baudrate,
                reset_duration_ms: reset_duration.as_millis() as u64,
                boot_wait_duration_ms: boot_wait_duration.as_millis() as u64,
                ..ActionSummary::default()
            },
            curr_stage: Stage::Stage1,
            encoding_start: Instant::now(),
            stage_start: Instant::now(),
        }
    }

    /// Called before encoding begins, if the action requires an image.
    pub fn will_start_encoding_image(&mut self, image_size: usize) {
        self.summary.image_size = image_size;
        self.encoding_start = Instant::now();
    }

    /// Called after encoding, with the size of the encoded byte buffer.
    pub fn finished_encoding_image(&mut self, encoded_image_size: usize) {
        self.summary.encoding_time = self.encoding_start.elapsed().as_secs_f32();
        self.summary.encoded_image_size = encoded_image_size;
    }

    /// The estimated total time for the action, in seconds.
    ///
    /// Accumulates the expected cost of the current and all remaining stages
    /// on top of the time already spent: the settings-derived reset and boot
    /// waits, the transmission times of the init bytes and the encoded image
    /// at the action's baudrate, and empirical constants for the status
    /// waits (observed on a 12 MHz Propeller).
    pub fn estimated_total_time(&self) -> f32 {
        let s = &self.summary;
        let seconds_per_byte = 10.0 / s.baudrate as f32;
        let mut estimate = s.total_time;

        let stage = self.curr_stage;
        if stage <= Stage::Stage1 {
            // Keeps the estimate non-zero.
            estimate += 0.1;
        }
        if stage <= Stage::Stage2a {
            estimate += s.reset_duration_ms as f32 / 1000.0;
            if s.action == Action::Restart {
                return estimate;
            }
        }
        if stage <= Stage::Stage2b {
            estimate += s.boot_wait_duration_ms as f32 / 1000.0;
        }
        if stage <= Stage::Stage3 {
            estimate += INIT_BYTES.len() as f32 * seconds_per_byte;
        }
        if stage <= Stage::Stage4a {
            // The command itself is insignificant (11 bytes).
            if s.action == Action::Shutdown {
                return estimate;
            }
        }
        if stage <= Stage::Stage4b {
            estimate += s.encoded_image_size as f32 * seconds_per_byte;
        }
        if stage <= Stage::Stage5 {
            estimate += 0.1;
            if s.action == Action::LoadRam {
                return estimate;
            }
        }
        if stage <= Stage::Stage6 {
            estimate += 3.7;
        }
        if stage <= Stage::Stage7 {
            estimate += 1.3;
        }
        estimate
    }

    pub fn end_stage1(&mut self) {
        debug_assert_eq!(self.curr_stage, Stage::Stage1);
        self.advance();
        self.summary.stage1_time = self.stage_time();
        self.summary.total_time += self.summary.stage1_time;
    }

    pub fn end_stage2a(&mut self) {
        debug_assert_eq!(self.curr_stage, Stage::Stage2a);
        self.advance();
        self.summary.stage2a_time = self.stage_time();
        self.summary.stage2_time = self.summary.stage2a_time;
        self.summary.total_time += self.summary.stage2a_time;
    }

    pub fn end_stage2b(&mut self) {
        debug_assert_eq!(self.curr_stage, Stage::Stage2b);
        self.advance();
        self.summary.stage2b_time = self.stage_time();
        self.summary.stage2_time += self.summary.stage2b_time;
        self.summary.total_time += self.summary.stage2b_time;
    }

    pub fn end_stage3(&mut self) {
        debug_assert_eq!(self.curr_stage, Stage::Stage3);
        self.advance();
        self.summary.stage3_time = self.stage_time();
        self.summary.total_time += self.summary.stage3_time;
    }

    pub fn end_stage4a(&mut self) {
        debug_assert_eq!(self.curr_stage, Stage::Stage4a);
        self.advance();
        self.summary.stage4a_time = self.stage_time();
        self.summary.stage4_time = self.summary.stage4a_time;
        self.summary.total_time += self.summary.stage4a_time;
    }

    pub fn end_stage4b(&mut self) {
        debug_assert_eq!(self.curr_stage, Stage::Stage4b);
        self.advance();
        self.summary.stage4b_time = self.stage_time();
        self.summary.stage4_time += self.summary.stage4b_time;
        self.summary.total_time += self.summary.stage4b_time;
    }

    pub fn end_stage5(&mut self) {
        debug_assert_eq!(self.curr_stage, Stage::Stage5);
        self.advance();
        self.summary.stage5_time = self.stage_time();
        self.summary.total_time += self.summary.stage5_time;
    }

    pub fn end_stage6(&mut self) {
        debug_assert_eq!(self.curr_stage, Stage::Stage6);
        self.advance();
        self.summary.stage6_time = self.stage_time();
        self.summary.total_time += self.summary.stage6_time;
    }

    pub fn end_stage7(&mut self) {
        debug_assert_eq!(self.curr_stage, Stage::Stage7);
        self.summary.stage7_time = self.stage_time();
        self.summary.total_time += self.summary.stage7_time;
    }

    /// Closes the profile for a successful action.
    pub fn end_ok(&mut self) {
        self.curr_stage = Stage::Finished;
        self.summary.was_successful = true;
    }

    /// Closes the profile for a failed action, first closing the timer of
    /// whichever stage the failure interrupted.
    pub fn end_with_error(&mut self, error_kind: ErrorKind) {
        match self.curr_stage {
            Stage::Stage1 => self.end_stage1(),
            Stage::Stage2a => self.end_stage2a(),
            Stage::Stage2b => self.end_stage2b(),
            Stage::Stage3 => self.end_stage3(),
            Stage::Stage4a => self.end_stage4a(),
            Stage::Stage4b => self.end_stage4b(),
            Stage::Stage5 => self.end_stage5(),
            Stage::Stage6 => self.end_stage6(),
            Stage::Stage7 => self.end_stage7(),
            Stage::Finished => debug_assert!(false, "profile already closed"),
        }
        self.curr_stage = Stage::Finished;
        self.summary.was_successful = false;
        self.summary.error_kind = error_kind;
    }

    fn advance(&mut self) {
        self.curr_stage = match self.curr_stage {
            Stage::Stage1 => Stage::Stage2a,
            Stage::Stage2a => Stage::Stage2b,
            Stage::Stage2b => Stage::Stage3,
            Stage::Stage3 => Stage::Stage4a,
            Stage::Stage4a => Stage::Stage4b,
            Stage::Stage4b => Stage::Stage5,
            Stage::Stage5 => Stage::Stage6,
            Stage::Stage6 => Stage::Stage7,
            Stage::Stage7 | Stage::Finished => Stage::Finished,
        };
    }

    /// Time since the previous stage boundary, like the lap feature of a
    /// stopwatch.
    fn stage_time(&mut self) -> f32 {
        let now = Instant::now();
        let time = (now - self.stage_start).as_secs_f32();
        self.stage_start = now;
        time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profiler_for(action: Action) -> Profiler {
        Profiler::new(
            action,
            115_200,
            Duration::from_millis(10),
            Duration::from_millis(100),
        )
    }

    #[test]
    fn restart_estimate_covers_only_reset() {
        let profiler = profiler_for(Action::Restart);
        let estimate = profiler.estimated_total_time();
        assert!((estimate - 0.11).abs() < 0.001, "estimate {estimate}");
    }

    #[test]
    fn eeprom_estimate_includes_status_waits() {
        let mut profiler = profiler_for(Action::ProgramEepromThenRun);
        profiler.will_start_encoding_image(32768);
        profiler.finished_encoding_image(87382);
        let estimate = profiler.estimated_total_time();
        // Dominated by the image transit (~7.6 s) plus the empirical 0.1 +
        // 3.7 + 1.3 s status waits.
        assert!(estimate > 12.0, "estimate {estimate}");
        assert!(estimate < 14.0, "estimate {estimate}");
    }

    #[test]
    fn estimate_shrinks_as_stages_complete() {
        let mut profiler = profiler_for(Action::Shutdown);
        let before = profiler.estimated_total_time();
        profiler.end_stage1();
        profiler.end_stage2a();
        profiler.end_stage2b();
        // Elapsed time is ~0, so dropping the boot wait and reset terms must
        // shrink the estimate.
        assert!(profiler.estimated_total_time() < before);
    }

    #[test]
    fn error_closes_the_interrupted_stage() {
        let mut profiler = profiler_for(Action::LoadRam);
        profiler.end_stage1();
        profiler.end_stage2a();
        profiler.end_with_error(ErrorKind::FailedToFlushInput);
        let summary = &profiler.summary;
        assert!(!summary.was_successful);
        assert_eq!(summary.error_kind, ErrorKind::FailedToFlushInput);
        // Stage 2b was interrupted; its timer still closed.
        assert_eq!(
            summary.stage2_time,
            summary.stage2a_time + summary.stage2b_time
        );
    }

    #[test]
    fn successful_profile_reports_aggregates() {
        let mut profiler = profiler_for(Action::Shutdown);
        profiler.end_stage1();
        profiler.end_stage2a();
        profiler.end_stage2b();
        profiler.end_stage3();
        profiler.end_stage4a();
        profiler.end_ok();
        let summary = &profiler.summary;
        assert!(summary.was_successful);
        assert_eq!(summary.error_kind, ErrorKind::None);
        let stage_sum = summary.stage1_time
            + summary.stage2a_time
            + summary.stage2b_time
            + summary.stage3_time
            + summary.stage4a_time;
        assert!((summary.total_time - stage_sum).abs() < 1e-6);
    }
}
