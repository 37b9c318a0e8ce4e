use log::{LevelFilter, Log, Metadata, Record};

use super::report::ResultChannel;
use crate::layout::{RESULT_SYNC, TestResult};
use crate::x86::CpuOps;

/// Forwards `log` records to the host as informational results.
///
/// Every record is one round trip: it is posted as TINFO and the guest halts
/// until the host has printed it. Records logged while a signal is pending
/// are dropped, so the host still sees the signal.
pub struct GuestLogger<C> {
    channel: ResultChannel<'static>,
    cpu: C,
    level: LevelFilter,
}

impl<C: CpuOps> GuestLogger<C> {
    pub const fn new(channel: ResultChannel<'static>, cpu: C, level: LevelFilter) -> Self {
        Self { channel, cpu, level }
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    /// Posts `record` without yielding. Returns `false` if a pending signal
    /// kept it from being posted.
    pub fn post(&self, record: &Record) -> bool {
        if self.channel.record().result() == RESULT_SYNC {
            return false;
        }
        self.channel.post_args(
            TestResult::Info,
            None,
            record.line().unwrap_or(0),
            format_args!("[{}] {}", record.target(), record.args()),
        );
        true
    }

    /// Posts `record` if its level is enabled and waits for the host.
    pub fn forward(&self, record: &Record) {
        if record.level() <= self.level && self.post(record) {
            self.cpu.halt();
        }
    }
}

impl<C: CpuOps + Send + Sync> Log for GuestLogger<C> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        self.forward(record);
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::ResultRecord;
    use crate::test_utils::mock::MockCpu;

    #[test]
    fn test_post_record() {
        let record: &'static ResultRecord = Box::leak(Box::new(ResultRecord::new()));
        let logger = GuestLogger::new(ResultChannel::new(record), MockCpu::new(), LevelFilter::Info);

        assert!(logger.post(
            &Record::builder()
                .args(format_args!("vmcb at {:#x}", 0x20_0000))
                .target("svm")
                .line(Some(9))
                .build(),
        ));
        assert_eq!(record.result(), TestResult::Info.code());
        assert_eq!(record.line(), 9);
        assert_eq!(unsafe { record.message() }, b"[svm] vmcb at 0x200000");
        assert_eq!(logger.level(), LevelFilter::Info);
    }

    #[test]
    fn test_pending_signal_is_kept() {
        let record: &'static ResultRecord = Box::leak(Box::new(ResultRecord::new()));
        let channel = ResultChannel::new(record);
        let logger = GuestLogger::new(channel, MockCpu::new(), LevelFilter::Trace);

        channel.signal_host(7);
        logger.forward(&Record::builder().args(format_args!("noise")).level(log::Level::Info).build());
        assert_eq!(record.result(), RESULT_SYNC);
        assert_eq!(logger.cpu.halt_count(), 0);

        record.clear();
        logger.forward(&Record::builder().args(format_args!("after")).level(log::Level::Info).build());
        assert_eq!(record.result(), TestResult::Info.code());
        assert_eq!(logger.cpu.halt_count(), 1);
    }
}
