//! Guest side of the Result Record.

use core::fmt::{self, Write};

use super::format::{FormatArg, format};
use crate::error::Result;
use crate::layout::{MESSAGE_CAPACITY, RESULT_EXIT, RESULT_NONE, ResultRecord, TestResult};

/// Writes results and signals into the shared [`ResultRecord`].
///
/// Posting only fills the record; yielding to the host (halting) is up to the
/// caller, see [`Reporter`](super::Reporter).
#[derive(Clone, Copy)]
pub struct ResultChannel<'a> {
    record: &'a ResultRecord,
}

impl<'a> ResultChannel<'a> {
    pub const fn new(record: &'a ResultRecord) -> Self {
        Self { record }
    }

    pub fn record(&self) -> &'a ResultRecord {
        self.record
    }

    /// Posts `result` with a printf-style message.
    ///
    /// `file` must be NUL-terminated: the host reads it as a C string. An
    /// invalid format string turns the result into [`TestResult::Broken`].
    pub fn post(&self, result: TestResult, file: &'static str, line: u32, fmt: &str, args: &[FormatArg]) {
        debug_assert!(file.ends_with('\0'));
        // SAFETY: the guest is the only writer and the host reads only after
        // the guest halts.
        unsafe {
            self.record.publish(line as i32, file.as_ptr() as u64, |msg| {
                match format(msg, fmt, args) {
                    Ok(_) => result.code(),
                    Err(_) => {
                        let _ = format(msg, "Invalid format string: %s", &[fmt.into()]);
                        TestResult::Broken.code()
                    }
                }
            });
        }
    }

    /// Posts `result` with a message built by `core::fmt`. Without `file`
    /// the host sees no source location.
    pub fn post_args(&self, result: TestResult, file: Option<&'static str>, line: u32, args: fmt::Arguments) {
        let file_addr = file.map_or(0, |f| {
            debug_assert!(f.ends_with('\0'));
            f.as_ptr() as u64
        });
        // SAFETY: see `post`.
        unsafe {
            self.record.publish(line as i32, file_addr, |msg| {
                let mut writer = MessageWriter { buf: msg, pos: 0 };
                let _ = writer.write_fmt(args);
                writer.buf[writer.pos] = 0;
                result.code()
            });
        }
    }

    /// Marks the test as finished.
    pub fn post_exit(&self) {
        // SAFETY: see `post`.
        unsafe {
            self.record.publish(0, 0, |msg| {
                msg[0] = 0;
                RESULT_EXIT
            });
        }
    }

    /// Posts a signal carrying `data` for the host to pick up while the guest
    /// keeps running.
    pub fn signal_host(&self, data: u64) {
        self.record.post_signal(data);
    }

    /// Signals the host and spins until it clears the record.
    pub fn wait_host(&self, data: u64) {
        self.signal_host(data);
        while self.record.result() != RESULT_NONE {
            core::hint::spin_loop();
        }
    }
}

/// Something that can post results and yield to the host: the runtime
/// itself, or the context handed to an interrupt callback.
pub trait Reporter {
    fn channel(&self) -> ResultChannel<'_>;
    /// Halts once so the host can process the record.
    fn yield_to_host(&self);
    fn halt_forever(&self) -> !;

    /// Posts a checkpoint result and yields to the host.
    fn report(&self, result: TestResult, file: &'static str, line: u32, fmt: &str, args: &[FormatArg]) {
        self.channel().post(result, file, line, fmt, args);
        self.yield_to_host();
    }

    /// Reports `result`, then finishes the test and stops the guest for good.
    fn abort(&self, result: TestResult, file: &'static str, line: u32, fmt: &str, args: &[FormatArg]) -> ! {
        self.report(result, file, line, fmt, args);
        self.finish()
    }

    /// Like [`abort`](Reporter::abort) with a `core::fmt` message.
    fn abort_args(&self, result: TestResult, file: &'static str, line: u32, args: fmt::Arguments) -> ! {
        self.channel().post_args(result, Some(file), line, args);
        self.yield_to_host();
        self.finish()
    }

    /// Posts the finished sentinel and halts for good.
    fn finish(&self) -> ! {
        self.channel().post_exit();
        self.halt_forever()
    }

    /// Unwraps `res`, aborting with the error's outcome and message.
    fn check<T>(&self, res: Result<T>, file: &'static str, line: u32) -> T {
        match res {
            Ok(value) => value,
            Err(err) => self.abort_args(err.outcome(), file, line, format_args!("{err}")),
        }
    }
}

/// Truncating `fmt::Write` over the message buffer, keeping room for the NUL.
struct MessageWriter<'b> {
    buf: &'b mut [u8; MESSAGE_CAPACITY],
    pos: usize,
}

impl Write for MessageWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = MESSAGE_CAPACITY - 1 - self.pos;
        let n = s.len().min(room);
        self.buf[self.pos..self.pos + n].copy_from_slice(&s.as_bytes()[..n]);
        self.pos += n;
        Ok(())
    }
}
