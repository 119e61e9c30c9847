//! Sensor producer mode
//!
//! Runs as a child of the orchestrator: frames samples off the serial board
//! and writes one JSON line per sample to stdout. Logs go to stderr.

use std::io::{self, BufRead, BufReader, Write};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use ew_core::constants::{exit, limits};
use ew_core::{EmberwatchError, SampleFramer, SerialPort, Settings};

/// Samples may arrive this fraction of the interval early and still be kept
const INTERVAL_JITTER_DIVISOR: u32 = 10;

/// Why the producer loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerEnd {
    /// Stdout reader went away
    ConsumerGone,
    /// Device closed or failed
    DeviceLost,
    /// Stdout write failed for another reason
    OutputFailed,
}

impl ProducerEnd {
    pub fn exit_code(&self) -> i32 {
        match self {
            ProducerEnd::ConsumerGone => exit::SUCCESS,
            ProducerEnd::DeviceLost | ProducerEnd::OutputFailed => exit::FAILURE,
        }
    }
}

/// Counts repeated errors so only the first and every Nth are logged
#[derive(Debug, Default)]
struct ErrorCounter {
    count: u64,
}

impl ErrorCounter {
    fn record(&mut self) -> bool {
        self.count += 1;
        self.count == 1 || self.count % limits::ERROR_LOG_EVERY == 0
    }
}

/// Frame samples from `framer` and write them to `out` until something ends the loop.
///
/// Samples closer together than `interval` are dropped. A zero interval
/// keeps every sample.
pub fn run_producer_loop<R: BufRead, W: Write>(
    framer: &mut SampleFramer<R>,
    out: &mut W,
    interval: Duration,
) -> ProducerEnd {
    let min_spacing = interval.saturating_sub(interval / INTERVAL_JITTER_DIVISOR);
    let mut last_emit: Option<Instant> = None;
    let mut errors = ErrorCounter::default();
    let mut emitted: u64 = 0;

    loop {
        let message = match framer.next_sample() {
            Ok(message) => message,
            Err(EmberwatchError::Io(e))
                if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) =>
            {
                continue;
            }
            Err(EmberwatchError::DeviceClosed) => {
                warn!("Sensor device closed after {} samples", emitted);
                return ProducerEnd::DeviceLost;
            }
            Err(EmberwatchError::Io(e)) => {
                error!("Sensor device read failed: {}", e);
                return ProducerEnd::DeviceLost;
            }
            Err(e @ EmberwatchError::Serial { .. }) => {
                error!("{}", e);
                return ProducerEnd::DeviceLost;
            }
            Err(e) => {
                if errors.record() {
                    warn!(errors = errors.count, "Dropped sensor sample: {}", e);
                }
                continue;
            }
        };

        let now = Instant::now();
        if let Some(last) = last_emit {
            if now.duration_since(last) < min_spacing {
                debug!("Sample arrived early, dropping");
                continue;
            }
        }

        let line = match message.to_line() {
            Ok(line) => line,
            Err(e) => {
                if errors.record() {
                    warn!(errors = errors.count, "{}", e);
                }
                continue;
            }
        };

        if let Err(e) = out.write_all(line.as_bytes()).and_then(|_| out.flush()) {
            if e.kind() == io::ErrorKind::BrokenPipe {
                info!("Output closed after {} samples", emitted);
                return ProducerEnd::ConsumerGone;
            }
            error!("Failed to write sample: {}", e);
            return ProducerEnd::OutputFailed;
        }

        last_emit = Some(now);
        emitted += 1;
    }
}

/// Entry point for `emberwatchd sensor`; returns the process exit code
pub fn run_sensor(settings: &Settings) -> i32 {
    let sensor = &settings.sensor;
    let port = match SerialPort::open(
        &sensor.device_path,
        sensor.baud_rate,
        Duration::from_millis(sensor.read_timeout_ms),
    ) {
        Ok(port) => port,
        Err(e) => {
            error!("{}", e);
            return exit::FAILURE;
        }
    };
    info!(
        device = %sensor.device_path.display(),
        baud = sensor.baud_rate,
        "Sensor producer reading"
    );

    let mut framer = SampleFramer::new(BufReader::new(port));
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let end = run_producer_loop(
        &mut framer,
        &mut out,
        Duration::from_millis(sensor.sample_interval_ms),
    );
    end.exit_code()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    struct BrokenPipeWriter;

    impl Write for BrokenPipeWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Yields its script chunk by chunk, then a timeout, then EOF
    struct TimeoutThenData {
        chunks: Vec<io::Result<Vec<u8>>>,
    }

    impl Read for TimeoutThenData {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.chunks.is_empty() {
                return Ok(0);
            }
            match self.chunks.remove(0) {
                Ok(data) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Err(e) => Err(e),
            }
        }
    }

    fn framer(input: &str) -> SampleFramer<Cursor<Vec<u8>>> {
        SampleFramer::new(Cursor::new(input.as_bytes().to_vec()))
    }

    fn decode(out: &[u8]) -> Vec<ew_protocol::SensorMessage> {
        String::from_utf8_lossy(out)
            .lines()
            .map(|l| ew_protocol::decode_sensor_line(l).unwrap())
            .collect()
    }

    #[test]
    fn test_writes_json_lines_until_device_closes() {
        let mut framer = framer("noise\nstart\n31.5\n22\nstart\n29\n40.5\n");
        let mut out = Vec::new();
        let end = run_producer_loop(&mut framer, &mut out, Duration::ZERO);
        assert_eq!(end, ProducerEnd::DeviceLost);
        assert_eq!(end.exit_code(), 1);

        let samples = decode(&out);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].temperature, 31.5);
        assert_eq!(samples[1].humidity, 40.5);
        assert_eq!(samples[0].smoke_detected, Some(false));
    }

    #[test]
    fn test_bad_values_are_skipped() {
        let mut framer = framer("start\nNaN\n20\nstart\n25\n50\n");
        let mut out = Vec::new();
        run_producer_loop(&mut framer, &mut out, Duration::ZERO);
        let samples = decode(&out);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].temperature, 25.0);
    }

    #[test]
    fn test_broken_pipe_is_clean_exit() {
        let mut framer = framer("start\n20\n50\n");
        let end = run_producer_loop(&mut framer, &mut BrokenPipeWriter, Duration::ZERO);
        assert_eq!(end, ProducerEnd::ConsumerGone);
        assert_eq!(end.exit_code(), 0);
    }

    #[test]
    fn test_timeouts_are_waited_out() {
        let reader = TimeoutThenData {
            chunks: vec![
                Ok(b"start\n2".to_vec()),
                Err(io::Error::from(io::ErrorKind::TimedOut)),
                Ok(b"1\n33\n".to_vec()),
            ],
        };
        let mut framer = SampleFramer::new(BufReader::new(reader));
        let mut out = Vec::new();
        run_producer_loop(&mut framer, &mut out, Duration::ZERO);
        let samples = decode(&out);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].temperature, 21.0);
        assert_eq!(samples[0].humidity, 33.0);
    }

    #[test]
    fn test_interval_drops_early_samples() {
        let mut framer = framer("start\n20\n50\nstart\n21\n51\nstart\n22\n52\n");
        let mut out = Vec::new();
        run_producer_loop(&mut framer, &mut out, Duration::from_secs(60));
        let samples = decode(&out);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].temperature, 20.0);
    }

    #[test]
    fn test_error_counter_rate_limits() {
        let mut counter = ErrorCounter::default();
        let logged: Vec<bool> = (0..20).map(|_| counter.record()).collect();
        assert!(logged[0]);
        assert!(!logged[1]);
        assert!(logged[9]);
        assert!(logged[19]);
        assert_eq!(logged.iter().filter(|l| **l).count(), 3);
    }
}
