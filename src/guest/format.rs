//! A printf-style formatter that runs without an allocator or 64-bit
//! hardware division.
//!
//! Supported: `%c %s %p %d %i %o %u %x %X %%`, the `-` and `0` flags, a
//! decimal field width and the `hh h l ll z` length modifiers. The output is
//! truncated to the destination and always NUL-terminated when the
//! destination is non-empty.

/// One argument of a formatted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatArg<'a> {
    Int(i64),
    Uint(u64),
    Char(u8),
    Str(&'a str),
    Ptr(usize),
}

macro_rules! impl_from_int {
    ($variant:ident, $wide:ty, $($ty:ty),+) => {
        $(
            impl From<$ty> for FormatArg<'_> {
                fn from(value: $ty) -> Self {
                    Self::$variant(value as $wide)
                }
            }
        )+
    };
}

impl_from_int!(Int, i64, i8, i16, i32, i64, isize);
impl_from_int!(Uint, u64, u8, u16, u32, u64, usize);

impl From<char> for FormatArg<'_> {
    fn from(value: char) -> Self {
        Self::Char(if value.is_ascii() { value as u8 } else { b'?' })
    }
}

impl<'a> From<&'a str> for FormatArg<'a> {
    fn from(value: &'a str) -> Self {
        Self::Str(value)
    }
}

impl<T> From<*const T> for FormatArg<'_> {
    fn from(value: *const T) -> Self {
        Self::Ptr(value as usize)
    }
}

impl<T> From<*mut T> for FormatArg<'_> {
    fn from(value: *mut T) -> Self {
        Self::Ptr(value as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("unknown conversion at offset {0}")]
    UnknownConversion(usize),
    #[error("format string ends inside a conversion")]
    Truncated,
    #[error("missing argument for conversion at offset {0}")]
    MissingArgument(usize),
    #[error("argument type does not match conversion at offset {0}")]
    ArgumentMismatch(usize),
    #[error("field width too large at offset {0}")]
    WidthOverflow(usize),
}

/// Divides a 64-bit value by a 16-bit divisor using only 32-bit divisions.
///
/// Returns `(quotient, remainder)`. Panics if `divisor` is 0.
pub fn divmod_u64_u16(value: u64, divisor: u16) -> (u64, u16) {
    let divisor = divisor as u32;
    let mut quotient = 0u64;
    let mut rem = 0u32;
    for shift in [48, 32, 16, 0] {
        let cur = (rem << 16) | ((value >> shift) & 0xffff) as u32;
        quotient |= ((cur / divisor) as u64) << shift;
        rem = cur % divisor;
    }
    (quotient, rem as u16)
}

/// Formats `fmt` with `args` into `dst`.
///
/// Returns the length the complete output would have had, like `snprintf`.
/// On error `dst` is left untouched.
pub fn format(dst: &mut [u8], fmt: &str, args: &[FormatArg]) -> Result<usize, FormatError> {
    let mut counter = Counter(0);
    render(&mut counter, fmt, args)?;

    let mut writer = Writer { buf: dst, pos: 0 };
    // Cannot fail: the same input just rendered.
    let _ = render(&mut writer, fmt, args);
    if let Some(end) = writer.buf.get_mut(writer.pos) {
        *end = 0;
    }
    Ok(counter.0)
}

trait Sink {
    fn put(&mut self, byte: u8);

    fn put_all(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.put(b);
        }
    }

    fn repeat(&mut self, byte: u8, count: usize) {
        for _ in 0..count {
            self.put(byte);
        }
    }
}

struct Counter(usize);

impl Sink for Counter {
    fn put(&mut self, _byte: u8) {
        self.0 += 1;
    }
}

/// Writes as much as fits, keeping the last byte for the terminator.
struct Writer<'b> {
    buf: &'b mut [u8],
    pos: usize,
}

impl Sink for Writer<'_> {
    fn put(&mut self, byte: u8) {
        if self.pos + 1 < self.buf.len() {
            self.buf[self.pos] = byte;
            self.pos += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Length {
    Char,
    Short,
    Int,
    Long,
}

#[derive(Debug, Default, Clone, Copy)]
struct Spec {
    left: bool,
    zero: bool,
    width: usize,
}

impl Spec {
    fn pad_field(&self, sink: &mut impl Sink, prefix: &[u8], body: &[u8], numeric: bool) {
        let len = prefix.len() + body.len();
        let pad = self.width.saturating_sub(len);
        if self.left {
            sink.put_all(prefix);
            sink.put_all(body);
            sink.repeat(b' ', pad);
        } else if self.zero && numeric {
            sink.put_all(prefix);
            sink.repeat(b'0', pad);
            sink.put_all(body);
        } else {
            sink.repeat(b' ', pad);
            sink.put_all(prefix);
            sink.put_all(body);
        }
    }
}

const DIGITS_LOWER: &[u8; 16] = b"0123456789abcdef";
const DIGITS_UPPER: &[u8; 16] = b"0123456789ABCDEF";

fn digits(mut value: u64, base: u16, upper: bool, buf: &mut [u8; 24]) -> &[u8] {
    let table = if upper { DIGITS_UPPER } else { DIGITS_LOWER };
    let mut pos = buf.len();
    loop {
        let (q, r) = divmod_u64_u16(value, base);
        pos -= 1;
        buf[pos] = table[r as usize];
        value = q;
        if value == 0 {
            break;
        }
    }
    &buf[pos..]
}

fn numeric_arg(arg: Option<&FormatArg>, offset: usize) -> Result<u64, FormatError> {
    match arg {
        None => Err(FormatError::MissingArgument(offset)),
        Some(FormatArg::Int(v)) => Ok(*v as u64),
        Some(FormatArg::Uint(v)) => Ok(*v),
        Some(FormatArg::Char(c)) => Ok(*c as u64),
        Some(FormatArg::Ptr(p)) => Ok(*p as u64),
        Some(FormatArg::Str(_)) => Err(FormatError::ArgumentMismatch(offset)),
    }
}

fn render(sink: &mut impl Sink, fmt: &str, args: &[FormatArg]) -> Result<(), FormatError> {
    let bytes = fmt.as_bytes();
    let mut args = args.iter();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'%' {
            sink.put(bytes[i]);
            i += 1;
            continue;
        }

        let start = i;
        i += 1;
        let next = |i: usize| bytes.get(i).copied().ok_or(FormatError::Truncated);

        let mut spec = Spec::default();
        loop {
            match next(i)? {
                b'-' => spec.left = true,
                b'0' => spec.zero = true,
                _ => break,
            }
            i += 1;
        }
        while let c @ b'0'..=b'9' = next(i)? {
            spec.width = spec
                .width
                .checked_mul(10)
                .and_then(|w| w.checked_add((c - b'0') as usize))
                .filter(|&w| w <= i32::MAX as usize)
                .ok_or(FormatError::WidthOverflow(start))?;
            i += 1;
        }

        let length = match next(i)? {
            b'h' if next(i + 1)? == b'h' => {
                i += 2;
                Length::Char
            }
            b'h' => {
                i += 1;
                Length::Short
            }
            b'l' if next(i + 1)? == b'l' => {
                i += 2;
                Length::Long
            }
            b'l' | b'z' => {
                i += 1;
                Length::Long
            }
            _ => Length::Int,
        };

        let conv = next(i)?;
        i += 1;
        let mut buf = [0u8; 24];
        match conv {
            b'%' => sink.put(b'%'),
            b'c' => {
                let c = numeric_arg(args.next(), start)? as u8;
                spec.pad_field(sink, &[], &[c], false);
            }
            b's' => match args.next() {
                Some(FormatArg::Str(s)) => spec.pad_field(sink, &[], s.as_bytes(), false),
                Some(_) => return Err(FormatError::ArgumentMismatch(start)),
                None => return Err(FormatError::MissingArgument(start)),
            },
            b'p' => {
                let value = numeric_arg(args.next(), start)?;
                spec.pad_field(sink, b"0x", digits(value, 16, false, &mut buf), true);
            }
            b'd' | b'i' => {
                let raw = numeric_arg(args.next(), start)?;
                let value = match length {
                    Length::Char => raw as i8 as i64,
                    Length::Short => raw as i16 as i64,
                    Length::Int => raw as i32 as i64,
                    Length::Long => raw as i64,
                };
                let prefix: &[u8] = if value < 0 { b"-" } else { b"" };
                spec.pad_field(sink, prefix, digits(value.unsigned_abs(), 10, false, &mut buf), true);
            }
            b'o' | b'u' | b'x' | b'X' => {
                let raw = numeric_arg(args.next(), start)?;
                let value = match length {
                    Length::Char => raw as u8 as u64,
                    Length::Short => raw as u16 as u64,
                    Length::Int => raw as u32 as u64,
                    Length::Long => raw,
                };
                let base = match conv {
                    b'o' => 8,
                    b'u' => 10,
                    _ => 16,
                };
                spec.pad_field(sink, &[], digits(value, base, conv == b'X', &mut buf), true);
            }
            _ => return Err(FormatError::UnknownConversion(start)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt_to_string(fmt: &str, args: &[FormatArg]) -> String {
        let mut buf = [0u8; 128];
        let len = format(&mut buf, fmt, args).unwrap();
        assert_eq!(buf[len], 0);
        String::from_utf8(buf[..len].to_vec()).unwrap()
    }

    #[test]
    fn test_divmod() {
        assert_eq!(divmod_u64_u16(0, 10), (0, 0));
        assert_eq!(divmod_u64_u16(u64::MAX, 10), (u64::MAX / 10, (u64::MAX % 10) as u16));
        assert_eq!(divmod_u64_u16(u64::MAX, 0xffff), (u64::MAX / 0xffff, 0));
        assert_eq!(
            divmod_u64_u16(0x1234_5678_9abc_def0, 7),
            (0x1234_5678_9abc_def0 / 7, (0x1234_5678_9abc_def0u64 % 7) as u16)
        );
    }

    #[test]
    fn test_integers_match_std() {
        let samples = [
            0i64,
            1,
            -1,
            9,
            10,
            -10,
            255,
            65536,
            i32::MAX as i64,
            i32::MIN as i64,
            i64::MAX,
            i64::MIN,
            0x1234_5678_9abc_def0,
        ];
        for v in samples {
            assert_eq!(fmt_to_string("%lld", &[v.into()]), std::format!("{v}"));
            assert_eq!(fmt_to_string("%lli", &[v.into()]), std::format!("{v}"));
            let u = v as u64;
            assert_eq!(fmt_to_string("%llu", &[u.into()]), std::format!("{u}"));
            assert_eq!(fmt_to_string("%llx", &[u.into()]), std::format!("{u:x}"));
            assert_eq!(fmt_to_string("%llX", &[u.into()]), std::format!("{u:X}"));
            assert_eq!(fmt_to_string("%llo", &[u.into()]), std::format!("{u:o}"));
        }
    }

    #[test]
    fn test_length_modifiers_truncate() {
        assert_eq!(fmt_to_string("%d", &[0x1_0000_0005i64.into()]), "5");
        assert_eq!(fmt_to_string("%hhd", &[0xffi32.into()]), "-1");
        assert_eq!(fmt_to_string("%hu", &[0x12345u32.into()]), "9029");
        assert_eq!(fmt_to_string("%x", &[(-1i64).into()]), "ffffffff");
        assert_eq!(fmt_to_string("%zx", &[usize::MAX.into()]), "ffffffffffffffff");
    }

    #[test]
    fn test_flags_and_width() {
        assert_eq!(fmt_to_string("[%5d]", &[42.into()]), "[   42]");
        assert_eq!(fmt_to_string("[%-5d]", &[42.into()]), "[42   ]");
        assert_eq!(fmt_to_string("[%05d]", &[(-42).into()]), "[-0042]");
        assert_eq!(fmt_to_string("[%08x]", &[0xbeefu32.into()]), "[0000beef]");
        assert_eq!(fmt_to_string("[%6s]", &["ab".into()]), "[    ab]");
        assert_eq!(fmt_to_string("[%-3c]", &['z'.into()]), "[z  ]");
    }

    #[test]
    fn test_other_conversions() {
        let ptr = 0xfffff000usize as *const u8;
        assert_eq!(fmt_to_string("%p", &[ptr.into()]), "0xfffff000");
        assert_eq!(fmt_to_string("100%%", &[]), "100%");
        assert_eq!(
            fmt_to_string("%s at %c%d", &["Page fault".into(), 'x'.into(), 3.into()]),
            "Page fault at x3"
        );
    }

    #[test]
    fn test_truncation_reports_full_length() {
        let mut buf = [0xffu8; 6];
        let len = format(&mut buf, "value=%u", &[123456u32.into()]).unwrap();
        assert_eq!(len, 12);
        assert_eq!(&buf, b"value\0");

        let mut empty = [0u8; 0];
        assert_eq!(format(&mut empty, "abc", &[]), Ok(3));
    }

    #[test]
    fn test_errors_leave_destination_untouched() {
        let mut buf = [0x55u8; 16];
        assert_eq!(
            format(&mut buf, "ok %q", &[]),
            Err(FormatError::UnknownConversion(3))
        );
        assert_eq!(format(&mut buf, "%d", &[]), Err(FormatError::MissingArgument(0)));
        assert_eq!(
            format(&mut buf, "%d %s", &[1.into(), 2.into()]),
            Err(FormatError::ArgumentMismatch(3))
        );
        assert_eq!(format(&mut buf, "abc %0", &[]), Err(FormatError::Truncated));
        assert_eq!(
            format(&mut buf, "x %99999999999999999999999d", &[1.into()]),
            Err(FormatError::WidthOverflow(2))
        );
        assert_eq!(format(&mut buf, "%2147483648d", &[1.into()]), Err(FormatError::WidthOverflow(0)));
        assert!(buf.iter().all(|&b| b == 0x55));
    }
}
