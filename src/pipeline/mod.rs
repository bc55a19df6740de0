//! Event loop state machine
//!
//! Drives the grab / remap / re-emit cycle and owns both device handles for
//! the duration of the run. Every exit path runs the Draining sequence so
//! the grab is released and the virtual device destroyed before return.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::PipelineConfig;
use crate::device::{DeviceError, EventSink, EventSource, ReadStatus};
use crate::remap::RemapPolicy;

/// Errors that end a run
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Device(#[from] DeviceError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Lifecycle of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Initializing,
    Running,
    Draining,
    Terminated,
}

/// The orchestrator: one source, one sink, one policy.
///
/// Construction order is the caller's contract: the source must be open and
/// the sink already created from its capabilities before `run()` grabs the
/// source. Grabbing earlier would starve the capability clone.
pub struct Pipeline<S: EventSource, K: EventSink> {
    source: S,
    sink: K,
    policy: RemapPolicy,
    terminate_key: u16,
    poll_timeout: Duration,
    trace_events: bool,
    shutdown: Arc<AtomicBool>,
    state: LoopState,
    forwarded: u64,
}

impl<S: EventSource, K: EventSink> Pipeline<S, K> {
    pub fn new(
        source: S,
        sink: K,
        policy: RemapPolicy,
        terminate_key: u16,
        config: &PipelineConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            source,
            sink,
            policy,
            terminate_key,
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            trace_events: config.trace_events,
            shutdown,
            state: LoopState::Initializing,
            forwarded: 0,
        }
    }

    /// Events forwarded to the sink so far
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    /// Run to completion: grab, loop until the terminate key, a shutdown
    /// signal, or a fatal read error, then drain. The grab/release pairing
    /// holds on every path out of here.
    pub fn run(&mut self) -> PipelineResult<()> {
        debug_assert_eq!(self.state, LoopState::Initializing);

        if let Err(e) = self.source.grab() {
            // Nothing was grabbed; still tear the sink down.
            self.drain();
            return Err(e.into());
        }

        self.state = LoopState::Running;
        tracing::info!(
            "Pipeline running ({} rules, terminate key {})",
            self.policy.len(),
            self.terminate_key
        );

        let fatal = self.run_loop();

        self.drain();

        match fatal {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// The Running state. Returns the fatal error that forced Draining, or
    /// `None` for a clean shutdown.
    fn run_loop(&mut self) -> Option<DeviceError> {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                tracing::info!("Shutdown signal received, draining");
                return None;
            }

            match self.source.next_event() {
                Ok(ReadStatus::Event(event)) => {
                    let out = self.policy.apply(event);
                    if self.trace_events {
                        tracing::debug!(
                            "Event type={:#04x} code={} value={} -> code={}",
                            event.type_,
                            event.code,
                            event.value,
                            out.code
                        );
                    }

                    // Fire-and-forget: a failed write must not stall the
                    // stream or leave the device grabbed.
                    if let Err(e) = self.sink.write_event(out.type_, out.code, out.value) {
                        tracing::warn!("Failed to write event to virtual device: {}", e);
                    }
                    self.forwarded += 1;

                    // Terminate check runs on the post-remap code. Remapping
                    // the terminate key away disables it on that physical
                    // key; remapping onto it arms another key.
                    if out.is_key_edge() && out.code == self.terminate_key {
                        tracing::info!("Terminate key observed, draining");
                        return None;
                    }
                }
                Ok(ReadStatus::Empty) => {
                    // Bounded wait so the shutdown flag is observed even on
                    // an idle device.
                    match self.source.wait_readable(self.poll_timeout) {
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!("Poll failed on source device: {}", e);
                            return Some(e);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Fatal read error, draining: {}", e);
                    return Some(e);
                }
            }
        }
    }

    /// The Draining state: release the grab, then destroy the virtual
    /// device, in that order. Best-effort; failures are logged, not
    /// propagated, so one broken step never skips the next.
    fn drain(&mut self) {
        self.state = LoopState::Draining;

        if self.source.is_grabbed() {
            if let Err(e) = self.source.release() {
                tracing::warn!("Failed to release source grab: {}", e);
            }
        }
        if let Err(e) = self.sink.destroy() {
            tracing::warn!("Failed to destroy virtual device: {}", e);
        }

        self.state = LoopState::Terminated;
        tracing::info!("Pipeline terminated after {} events", self.forwarded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::event::{RawEvent, EV_KEY, EV_SYN, KEY_A, KEY_B, KEY_ESC, SYN_REPORT};
    use crate::device::DeviceResult;
    use crate::remap::RemapRule;
    use std::collections::VecDeque;

    /// Scripted source: hands out a fixed sequence of read outcomes and
    /// counts grab/release transitions. An exhausted script reads as a
    /// hard I/O failure so a runaway loop cannot hang the tests.
    struct MockSource {
        script: VecDeque<DeviceResult<ReadStatus>>,
        grabbed: bool,
        grab_calls: usize,
        release_calls: usize,
        fail_grab: bool,
    }

    impl MockSource {
        fn new(script: Vec<DeviceResult<ReadStatus>>) -> Self {
            Self {
                script: script.into(),
                grabbed: false,
                grab_calls: 0,
                release_calls: 0,
                fail_grab: false,
            }
        }

        fn failing_grab() -> Self {
            let mut source = Self::new(Vec::new());
            source.fail_grab = true;
            source
        }
    }

    impl EventSource for MockSource {
        fn grab(&mut self) -> DeviceResult<()> {
            self.grab_calls += 1;
            if self.fail_grab {
                return Err(DeviceError::Grab("already grabbed elsewhere".to_string()));
            }
            self.grabbed = true;
            Ok(())
        }

        fn release(&mut self) -> DeviceResult<()> {
            self.release_calls += 1;
            self.grabbed = false;
            Ok(())
        }

        fn is_grabbed(&self) -> bool {
            self.grabbed
        }

        fn next_event(&mut self) -> DeviceResult<ReadStatus> {
            self.script.pop_front().unwrap_or_else(|| {
                Err(DeviceError::Read(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "script exhausted",
                )))
            })
        }

        fn wait_readable(&mut self, _timeout: Duration) -> DeviceResult<bool> {
            Ok(true)
        }
    }

    /// Recording sink
    struct MockSink {
        writes: Vec<(u16, u16, i32)>,
        destroy_calls: usize,
        fail_writes: bool,
    }

    impl MockSink {
        fn new() -> Self {
            Self {
                writes: Vec::new(),
                destroy_calls: 0,
                fail_writes: false,
            }
        }
    }

    impl EventSink for MockSink {
        fn write_event(&mut self, type_: u16, code: u16, value: i32) -> DeviceResult<()> {
            self.writes.push((type_, code, value));
            if self.fail_writes {
                return Err(DeviceError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "sink gone",
                )));
            }
            Ok(())
        }

        fn destroy(&mut self) -> DeviceResult<()> {
            self.destroy_calls += 1;
            Ok(())
        }
    }

    fn key(code: u16, value: i32) -> DeviceResult<ReadStatus> {
        Ok(ReadStatus::Event(RawEvent {
            tv_sec: 10,
            tv_usec: 20,
            type_: EV_KEY,
            code,
            value,
        }))
    }

    fn syn() -> DeviceResult<ReadStatus> {
        Ok(ReadStatus::Event(RawEvent {
            tv_sec: 10,
            tv_usec: 20,
            type_: EV_SYN,
            code: SYN_REPORT,
            value: 0,
        }))
    }

    fn read_error() -> DeviceResult<ReadStatus> {
        Err(DeviceError::Read(std::io::Error::new(
            std::io::ErrorKind::Other,
            "device unplugged",
        )))
    }

    /// The default single rule: KEY_A -> KEY_B.
    fn ab_policy() -> RemapPolicy {
        RemapPolicy::new(&[RemapRule::key(KEY_A, KEY_B)])
    }

    fn pipeline(
        source: MockSource,
        policy: RemapPolicy,
    ) -> Pipeline<MockSource, MockSink> {
        Pipeline::new(
            source,
            MockSink::new(),
            policy,
            KEY_ESC,
            &PipelineConfig::default(),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn test_remapped_key_is_emitted_substituted() {
        let source = MockSource::new(vec![key(KEY_A, 1), key(KEY_ESC, 1)]);
        let mut p = pipeline(source, ab_policy());

        p.run().unwrap();

        assert_eq!(
            p.sink.writes,
            vec![(EV_KEY, KEY_B, 1), (EV_KEY, KEY_ESC, 1)]
        );
        assert_eq!(p.state, LoopState::Terminated);
    }

    #[test]
    fn test_terminate_key_emitted_before_draining() {
        let source = MockSource::new(vec![key(KEY_ESC, 1)]);
        let mut p = pipeline(source, ab_policy());

        p.run().unwrap();

        // ESC itself still reaches the virtual device.
        assert_eq!(p.sink.writes, vec![(EV_KEY, KEY_ESC, 1)]);
        assert_eq!(p.source.grab_calls, 1);
        assert_eq!(p.source.release_calls, 1);
        assert_eq!(p.sink.destroy_calls, 1);
    }

    #[test]
    fn test_non_key_events_pass_through() {
        let source = MockSource::new(vec![syn(), key(KEY_ESC, 1)]);
        let mut p = pipeline(source, ab_policy());

        p.run().unwrap();

        assert_eq!(
            p.sink.writes,
            vec![(EV_SYN, SYN_REPORT, 0), (EV_KEY, KEY_ESC, 1)]
        );
    }

    #[test]
    fn test_ordering_preserved_one_write_per_event() {
        let source = MockSource::new(vec![
            key(KEY_A, 1),
            syn(),
            key(KEY_A, 0),
            syn(),
            key(5, 1),
            key(KEY_ESC, 0),
        ]);
        let mut p = pipeline(source, ab_policy());

        p.run().unwrap();

        assert_eq!(
            p.sink.writes,
            vec![
                (EV_KEY, KEY_B, 1),
                (EV_SYN, SYN_REPORT, 0),
                (EV_KEY, KEY_B, 0),
                (EV_SYN, SYN_REPORT, 0),
                (EV_KEY, 5, 1),
                (EV_KEY, KEY_ESC, 0),
            ]
        );
        assert_eq!(p.forwarded, 6);
    }

    #[test]
    fn test_fatal_read_error_still_drains() {
        let source = MockSource::new(vec![key(KEY_A, 1), read_error()]);
        let mut p = pipeline(source, ab_policy());

        let err = p.run().unwrap_err();
        assert!(matches!(err, PipelineError::Device(DeviceError::Read(_))));

        // The one good event was forwarded, and both teardown steps ran.
        assert_eq!(p.sink.writes.len(), 1);
        assert_eq!(p.source.release_calls, 1);
        assert_eq!(p.sink.destroy_calls, 1);
        assert_eq!(p.state, LoopState::Terminated);
    }

    #[test]
    fn test_grab_failure_destroys_sink_without_release() {
        let mut p = pipeline(MockSource::failing_grab(), ab_policy());

        let err = p.run().unwrap_err();
        assert!(matches!(err, PipelineError::Device(DeviceError::Grab(_))));

        assert!(p.sink.writes.is_empty());
        assert_eq!(p.source.grab_calls, 1);
        // Never grabbed, so nothing to release.
        assert_eq!(p.source.release_calls, 0);
        assert_eq!(p.sink.destroy_calls, 1);
    }

    #[test]
    fn test_terminate_checks_post_remap_code() {
        // A remaps onto the terminate key: pressing physical A drains.
        let policy = RemapPolicy::new(&[RemapRule::key(KEY_A, KEY_ESC)]);
        let source = MockSource::new(vec![key(KEY_A, 1), key(KEY_B, 1)]);
        let mut p = pipeline(source, policy);

        p.run().unwrap();

        assert_eq!(p.sink.writes, vec![(EV_KEY, KEY_ESC, 1)]);
        assert_eq!(p.forwarded, 1);
    }

    #[test]
    fn test_remapping_terminate_key_away_disables_it() {
        // ESC remapped to B: the physical terminate key no longer drains.
        let policy = RemapPolicy::new(&[RemapRule::key(KEY_ESC, KEY_B)]);
        let source = MockSource::new(vec![key(KEY_ESC, 1), read_error()]);
        let mut p = pipeline(source, policy);

        assert!(p.run().is_err());
        assert_eq!(p.sink.writes, vec![(EV_KEY, KEY_B, 1)]);
    }

    #[test]
    fn test_autorepeat_of_terminate_key_does_not_drain() {
        let source = MockSource::new(vec![key(KEY_ESC, 2), key(KEY_ESC, 1)]);
        let mut p = pipeline(source, ab_policy());

        p.run().unwrap();
        assert_eq!(p.forwarded, 2);
    }

    #[test]
    fn test_shutdown_flag_drains_cleanly() {
        let shutdown = Arc::new(AtomicBool::new(true));
        let source = MockSource::new(vec![key(KEY_A, 1)]);
        let mut p = Pipeline::new(
            source,
            MockSink::new(),
            ab_policy(),
            KEY_ESC,
            &PipelineConfig::default(),
            shutdown,
        );

        p.run().unwrap();

        assert!(p.sink.writes.is_empty());
        assert_eq!(p.source.grab_calls, 1);
        assert_eq!(p.source.release_calls, 1);
        assert_eq!(p.sink.destroy_calls, 1);
    }

    #[test]
    fn test_write_failures_do_not_stop_the_stream() {
        let source = MockSource::new(vec![key(KEY_A, 1), key(KEY_ESC, 1)]);
        let mut p = pipeline(source, ab_policy());
        p.sink.fail_writes = true;

        p.run().unwrap();

        // Both writes were attempted despite failures.
        assert_eq!(p.sink.writes.len(), 2);
        assert_eq!(p.source.release_calls, 1);
    }

    #[test]
    fn test_empty_reads_keep_looping() {
        let source = MockSource::new(vec![
            Ok(ReadStatus::Empty),
            Ok(ReadStatus::Empty),
            key(KEY_ESC, 1),
        ]);
        let mut p = pipeline(source, ab_policy());

        p.run().unwrap();
        assert_eq!(p.forwarded, 1);
    }
}
