//! Sensor board serial link
//!
//! The board prints a `start` line followed by two value lines, temperature
//! then humidity, roughly once per second. [`SampleFramer`] turns that line
//! stream into [`SensorMessage`]s; [`SerialPort`] is the tty underneath.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, Read};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, trace};

use ew_error::{EmberwatchError, Result};
use ew_protocol::{is_sync_marker, SensorMessage, LINE_TERMINATOR, MAX_LINE_BYTES};

use crate::constants::limits;

// ============================================================================
// Serial Port
// ============================================================================

/// Raw, read-only tty with a per-read timeout.
///
/// A read that times out with no data is reported as `TimedOut` rather than
/// `Ok(0)` so buffered readers do not mistake it for end-of-file.
#[derive(Debug)]
pub struct SerialPort {
    file: File,
    path: PathBuf,
}

impl SerialPort {
    pub fn open(path: &Path, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let speed = baud_constant(baud_rate).ok_or_else(|| {
            EmberwatchError::serial(path, format!("unsupported baud rate {}", baud_rate))
        })?;

        // O_NONBLOCK so the open does not wait for carrier detect
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| EmberwatchError::serial(path, format!("open failed: {}", e)))?;

        configure_tty(&file, speed, timeout)
            .map_err(|e| EmberwatchError::serial(path, format!("termios setup failed: {}", e)))?;

        debug!(device = %path.display(), baud = baud_rate, "Serial port configured");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Read for SerialPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.file.read(buf)? {
            0 if !buf.is_empty() => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "no data from serial device",
            )),
            n => Ok(n),
        }
    }
}

fn baud_constant(baud_rate: u32) -> Option<libc::speed_t> {
    let speed = match baud_rate {
        1200 => libc::B1200,
        2400 => libc::B2400,
        4800 => libc::B4800,
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        230400 => libc::B230400,
        _ => return None,
    };
    Some(speed)
}

/// Raw 8N1, receiver on, modem lines ignored, blocking reads bounded by VTIME
fn configure_tty(file: &File, speed: libc::speed_t, timeout: Duration) -> io::Result<()> {
    let fd = file.as_raw_fd();
    // Tenths of a second, the unit VTIME counts in
    let vtime = (timeout.as_millis() / 100).clamp(1, 255) as libc::cc_t;

    // SAFETY: termios is plain data; tcgetattr fully initializes it before use
    // and every call operates on a descriptor owned by `file`.
    unsafe {
        let mut tio: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut tio) != 0 {
            return Err(io::Error::last_os_error());
        }
        libc::cfmakeraw(&mut tio);
        tio.c_cflag |= libc::CLOCAL | libc::CREAD;
        tio.c_cc[libc::VMIN] = 0;
        tio.c_cc[libc::VTIME] = vtime;
        if libc::cfsetispeed(&mut tio, speed) != 0 || libc::cfsetospeed(&mut tio, speed) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::tcsetattr(fd, libc::TCSANOW, &tio) != 0 {
            return Err(io::Error::last_os_error());
        }
        // Drop whatever the board printed before we were listening
        libc::tcflush(fd, libc::TCIFLUSH);

        // Back to blocking now that CLOCAL is set; VTIME bounds each read
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

// ============================================================================
// Sample Framing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    /// Waiting for the sync marker
    Syncing { skipped: usize },
    Temperature,
    Humidity { temperature: f64 },
}

/// Turns `start` / temperature / humidity line triples into samples.
///
/// A timeout between lines keeps the position in the triple; the next call
/// picks up where the last left off.
pub struct SampleFramer<R> {
    reader: R,
    pending: Vec<u8>,
    /// Inside an over-long line, skipping to its terminator
    discarding: bool,
    phase: Phase,
    max_sync_lines: usize,
}

impl<R: BufRead> SampleFramer<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pending: Vec::with_capacity(64),
            discarding: false,
            phase: Phase::Syncing { skipped: 0 },
            max_sync_lines: limits::MAX_SYNC_LINES,
        }
    }

    pub fn with_max_sync_lines(mut self, lines: usize) -> Self {
        self.max_sync_lines = lines.max(1);
        self
    }

    /// Block until one complete sample has been framed.
    ///
    /// A malformed value drops the sample and resynchronizes on the next
    /// call. `SyncLost` means the marker never showed up.
    pub fn next_sample(&mut self) -> Result<SensorMessage> {
        loop {
            let line = match self.read_line() {
                Ok(line) => line,
                Err(e @ EmberwatchError::Decode(_)) => {
                    self.phase = Phase::Syncing { skipped: 0 };
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            match self.phase {
                Phase::Syncing { skipped } => {
                    if is_sync_marker(&line) {
                        self.phase = Phase::Temperature;
                    } else if skipped + 1 >= self.max_sync_lines {
                        self.phase = Phase::Syncing { skipped: 0 };
                        return Err(EmberwatchError::SyncLost { lines: skipped + 1 });
                    } else {
                        trace!("Skipping unsynchronized line {:?}", line);
                        self.phase = Phase::Syncing { skipped: skipped + 1 };
                    }
                }
                Phase::Temperature => {
                    self.phase = Phase::Syncing { skipped: 0 };
                    let temperature = parse_literal(&line)?;
                    self.phase = Phase::Humidity { temperature };
                }
                Phase::Humidity { temperature } => {
                    self.phase = Phase::Syncing { skipped: 0 };
                    let humidity = parse_literal(&line)?;
                    return Ok(SensorMessage::new(temperature, humidity));
                }
            }
        }
    }

    /// Next line without its terminator. Partial data survives read errors.
    ///
    /// At most `MAX_LINE_BYTES + 1` bytes are ever buffered. An over-long
    /// line is reported once and its remainder skipped up to the next
    /// terminator.
    fn read_line(&mut self) -> Result<String> {
        loop {
            let room = (MAX_LINE_BYTES + 1).saturating_sub(self.pending.len()) as u64;
            let n = (&mut self.reader)
                .take(room)
                .read_until(LINE_TERMINATOR, &mut self.pending)?;

            if self.pending.last() == Some(&LINE_TERMINATOR) {
                let raw = std::mem::take(&mut self.pending);
                if std::mem::take(&mut self.discarding) {
                    continue;
                }
                return Ok(String::from_utf8_lossy(&raw).trim().to_string());
            }

            if self.pending.len() > MAX_LINE_BYTES {
                self.pending.clear();
                if !self.discarding {
                    self.discarding = true;
                    return Err(EmberwatchError::Decode(ew_error::DecodeError::LineTooLong {
                        limit: MAX_LINE_BYTES,
                    }));
                }
                continue;
            }

            if n == 0 {
                // End of stream; an unterminated tail still counts as a line
                if self.pending.is_empty() || std::mem::take(&mut self.discarding) {
                    self.pending.clear();
                    return Err(EmberwatchError::DeviceClosed);
                }
                let raw = std::mem::take(&mut self.pending);
                return Ok(String::from_utf8_lossy(&raw).trim().to_string());
            }
        }
    }
}

/// Parse a value line as a plain number or a simple numeric literal:
/// surrounding whitespace, quotes or parentheses, a sign, and `_` digit
/// separators are accepted. The result must be finite.
pub fn parse_literal(raw: &str) -> Result<f64> {
    let invalid = |reason: &str| EmberwatchError::InvalidSensorValue {
        raw: raw.to_string(),
        reason: reason.to_string(),
    };

    let mut text = raw.trim();
    loop {
        let stripped = ['"', '\'']
            .iter()
            .find_map(|q| text.strip_prefix(*q).and_then(|t| t.strip_suffix(*q)))
            .or_else(|| text.strip_prefix('(').and_then(|t| t.strip_suffix(')')));
        match stripped {
            Some(inner) => text = inner.trim(),
            None => break,
        }
    }

    if text.is_empty() {
        return Err(invalid("empty value"));
    }
    if text.contains("__") || text.starts_with('_') || text.ends_with('_') {
        return Err(invalid("misplaced digit separator"));
    }
    if !text.chars().all(|c| c.is_ascii_digit() || "+-._eE".contains(c)) {
        return Err(invalid("not a numeric literal"));
    }

    let value: f64 = text
        .replace('_', "")
        .parse()
        .map_err(|_| invalid("not a number"))?;
    if !value.is_finite() {
        return Err(invalid("not finite"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn framer(input: &str) -> SampleFramer<Cursor<Vec<u8>>> {
        SampleFramer::new(Cursor::new(input.as_bytes().to_vec()))
    }

    #[test]
    fn test_parse_literal_forms() {
        assert_eq!(parse_literal("23.5").unwrap(), 23.5);
        assert_eq!(parse_literal("  -4\r").unwrap(), -4.0);
        assert_eq!(parse_literal("+7.25").unwrap(), 7.25);
        assert_eq!(parse_literal("\"41.0\"").unwrap(), 41.0);
        assert_eq!(parse_literal("'12'").unwrap(), 12.0);
        assert_eq!(parse_literal("(18.5)").unwrap(), 18.5);
        assert_eq!(parse_literal("((-3))").unwrap(), -3.0);
        assert_eq!(parse_literal("1_000.5").unwrap(), 1000.5);
        assert_eq!(parse_literal("2.5e1").unwrap(), 25.0);
    }

    #[test]
    fn test_parse_literal_rejects() {
        for bad in ["", "abc", "nan", "inf", "1e999", "__1", "1_", "12.5C", "\"12", "1 2"] {
            assert!(
                matches!(parse_literal(bad), Err(EmberwatchError::InvalidSensorValue { .. })),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_frames_after_sync() {
        let mut f = framer("garbage\n12.0\nstart\n31.5\n27.0\nstart\n32.0\n26.0\n");
        let first = f.next_sample().unwrap();
        assert_eq!((first.temperature, first.humidity), (31.5, 27.0));
        let second = f.next_sample().unwrap();
        assert_eq!((second.temperature, second.humidity), (32.0, 26.0));
        assert!(matches!(f.next_sample(), Err(EmberwatchError::DeviceClosed)));
    }

    #[test]
    fn test_crlf_device_output() {
        let mut f = framer("start\r\n20.0\r\n55.0\r\n");
        let s = f.next_sample().unwrap();
        assert_eq!((s.temperature, s.humidity), (20.0, 55.0));
    }

    #[test]
    fn test_bad_value_resyncs() {
        let mut f = framer("start\nerr\n50.0\nstart\n21.0\n40.0\n");
        assert!(matches!(f.next_sample(), Err(EmberwatchError::InvalidSensorValue { .. })));
        let s = f.next_sample().unwrap();
        assert_eq!((s.temperature, s.humidity), (21.0, 40.0));
    }

    #[test]
    fn test_sync_lost() {
        let noise: String = (0..10).map(|i| format!("noise {}\n", i)).collect();
        let mut f = framer(&noise).with_max_sync_lines(5);
        assert!(matches!(f.next_sample(), Err(EmberwatchError::SyncLost { lines: 5 })));
    }

    /// Reader that times out once in the middle of the triple
    struct Stutter {
        chunks: Vec<io::Result<Vec<u8>>>,
    }

    impl Read for Stutter {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.chunks.is_empty() {
                return Ok(0);
            }
            match self.chunks.remove(0) {
                Ok(bytes) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Err(e) => Err(e),
            }
        }
    }

    #[test]
    fn test_timeout_keeps_position() {
        let src = Stutter {
            chunks: vec![
                Ok(b"start\n3".to_vec()),
                Err(io::Error::new(io::ErrorKind::TimedOut, "slow")),
                Ok(b"3.5\n19.0\n".to_vec()),
            ],
        };
        let mut f = SampleFramer::new(io::BufReader::new(src));
        assert!(matches!(f.next_sample(), Err(EmberwatchError::Io(e)) if e.kind() == io::ErrorKind::TimedOut));
        let s = f.next_sample().unwrap();
        assert_eq!((s.temperature, s.humidity), (33.5, 19.0));
    }

    /// Endless line noise with no terminator, then a timeout
    struct Babble {
        remaining: usize,
    }

    impl Read for Babble {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.remaining == 0 {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "quiet"));
            }
            let n = buf.len().min(self.remaining);
            buf[..n].fill(b'x');
            self.remaining -= n;
            Ok(n)
        }
    }

    #[test]
    fn test_unterminated_noise_stays_bounded() {
        let src = Babble { remaining: 64 * MAX_LINE_BYTES };
        let mut f = SampleFramer::new(io::BufReader::new(src));

        assert!(matches!(
            f.next_sample(),
            Err(EmberwatchError::Decode(ew_error::DecodeError::LineTooLong { .. }))
        ));
        assert!(f.pending.len() <= MAX_LINE_BYTES + 1);

        // The rest of the noise is skipped without a second report
        assert!(matches!(f.next_sample(), Err(EmberwatchError::Io(e)) if e.kind() == io::ErrorKind::TimedOut));
        assert!(f.pending.len() <= MAX_LINE_BYTES + 1);
        assert!(f.discarding);
    }

    #[test]
    fn test_long_line_is_skipped_then_framing_resumes() {
        let long = "9".repeat(MAX_LINE_BYTES * 3);
        let input = format!("start\n{}\nstart\n22.0\n45.0\n", long);
        let mut f = framer(&input);

        assert!(matches!(
            f.next_sample(),
            Err(EmberwatchError::Decode(ew_error::DecodeError::LineTooLong { limit })) if limit == MAX_LINE_BYTES
        ));
        let s = f.next_sample().unwrap();
        assert_eq!((s.temperature, s.humidity), (22.0, 45.0));
        assert!(matches!(f.next_sample(), Err(EmberwatchError::DeviceClosed)));
    }

    #[test]
    fn test_baud_rates_cover_supported_list() {
        for rate in crate::constants::serial::SUPPORTED_BAUD_RATES {
            assert!(baud_constant(*rate).is_some(), "{}", rate);
        }
        assert!(baud_constant(12345).is_none());
    }

    #[test]
    fn test_open_missing_device() {
        let err = SerialPort::open(Path::new("/nonexistent/ttyX"), 9600, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, EmberwatchError::Serial { .. }));
    }
}
