//! SLIP trace recording and replay
//!
//! [TraceRecorder] wraps a live transport and logs every SLIP frame and
//! control-line change as one line of text. [TracePlayer] plays such a
//! recording back as a transport of its own, asserting that the engine
//! produces the recorded byte stream exactly. Together they turn a real
//! flashing session into a deterministic regression test.
//!
//! The format, one record per line:
//!
//! ```text
//! [  0.003] >>>> (    46): C0 00 08 24 00 ... C0
//! [  0.015] <<<< (    14): C0 01 08 04 00 ... C0
//! [  0.201] SET_CONTROL_LINES DTR=true RTS=false
//! ```

use std::io::{self, Write};
use std::thread::sleep;
use std::time::{Duration, Instant};

use crate::slip;
use crate::transport::SerialTransport;

pub(crate) fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A transport wrapper that logs framed traffic to `writer` while passing
/// everything through to the wrapped transport.
pub struct TraceRecorder<T: SerialTransport, W: Write> {
    delegate: T,
    writer: W,
    start: Instant,
    in_frame: bool,
    write_buffer: Vec<u8>,
    read_buffer: Vec<u8>,
}

impl<T: SerialTransport, W: Write> TraceRecorder<T, W> {
    pub fn new(delegate: T, writer: W) -> Self {
        TraceRecorder {
            delegate,
            writer,
            start: Instant::now(),
            in_frame: false,
            write_buffer: Vec::new(),
            read_buffer: Vec::new(),
        }
    }

    /// Close the recording and hand the wrapped transport back.
    pub fn into_inner(self) -> T {
        self.delegate
    }

    fn timestamp(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl<T: SerialTransport, W: Write> SerialTransport for TraceRecorder<T, W> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.delegate.read(buf)?;
        for &value in &buf[..read] {
            if value == slip::END {
                if self.in_frame {
                    self.read_buffer.push(value);
                    writeln!(
                        self.writer,
                        "[{:.3}] <<<< ({:6}): {}",
                        self.timestamp(),
                        self.read_buffer.len(),
                        hex_dump(&self.read_buffer)
                    )?;
                    self.writer.flush()?;
                    self.read_buffer.clear();
                    self.in_frame = false;
                } else {
                    self.read_buffer.clear();
                    self.read_buffer.push(value);
                    self.in_frame = true;
                }
            } else if self.in_frame {
                self.read_buffer.push(value);
            }
        }
        Ok(read)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        for &value in buf {
            self.write_buffer.push(value);
            // a frame closes on a delimiter that is not the opening one
            if value == slip::END && self.write_buffer.len() > 1 {
                writeln!(
                    self.writer,
                    "[{:.3}] >>>> ({:6}): {}",
                    self.timestamp(),
                    self.write_buffer.len(),
                    hex_dump(&self.write_buffer)
                )?;
                self.writer.flush()?;
                self.write_buffer.clear();
            }
        }
        self.delegate.write(buf)
    }

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> io::Result<()> {
        writeln!(
            self.writer,
            "[{:.3}] SET_CONTROL_LINES DTR={dtr} RTS={rts}",
            self.timestamp()
        )?;
        self.writer.flush()?;
        self.delegate.set_control_lines(dtr, rts)
    }

    fn read_buffer_size(&self) -> usize {
        self.delegate.read_buffer_size()
    }
}

#[derive(Debug, Clone)]
enum TraceEntry {
    Write {
        timestamp: f64,
        data: Vec<u8>,
    },
    Read {
        timestamp: f64,
        data: Vec<u8>,
    },
    ControlLines {
        timestamp: f64,
        dtr: bool,
        rts: bool,
    },
}

impl TraceEntry {
    fn timestamp(&self) -> f64 {
        match self {
            TraceEntry::Write { timestamp, .. }
            | TraceEntry::Read { timestamp, .. }
            | TraceEntry::ControlLines { timestamp, .. } => *timestamp,
        }
    }
}

/// Milliseconds of replay delay per recorded millisecond between frames.
/// Slightly above real time so deadline-driven code observes the same
/// timeouts it did during recording.
const READ_DELAY_SCALE: f64 = 1.1;

/// A transport that replays a recorded trace.
///
/// Writes and control-line changes are asserted byte-exact against the next
/// recorded entry; this type panics on divergence, which is the desired
/// behavior inside a test. Reads supply the recorded device bytes, delayed
/// in proportion to the recorded inter-frame gap so that timeout-driven
/// paths (sync draining, handshake waits) behave as they did live.
pub struct TracePlayer {
    entries: Vec<TraceEntry>,
    index: usize,
    read_buffer: Option<(Vec<u8>, usize)>,
    next_timestamp: f64,
    read_delay: Duration,
}

impl TracePlayer {
    pub fn parse(trace: &str) -> io::Result<Self> {
        let mut entries = Vec::new();
        for line in trace.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let close = line.find(']').ok_or_else(|| invalid_line(line))?;
            let timestamp: f64 = line[1..close]
                .trim()
                .parse()
                .map_err(|_| invalid_line(line))?;
            let rest = line[close + 1..].trim();

            if let Some(flags) = rest.strip_prefix("SET_CONTROL_LINES") {
                entries.push(TraceEntry::ControlLines {
                    timestamp,
                    dtr: flags.contains("DTR=true"),
                    rts: flags.contains("RTS=true"),
                });
            } else if rest.starts_with(">>>>") || rest.starts_with("<<<<") {
                let (_, hex) = rest.split_once(':').ok_or_else(|| invalid_line(line))?;
                let data = hex
                    .split_whitespace()
                    .map(|value| u8::from_str_radix(value, 16))
                    .collect::<Result<Vec<u8>, _>>()
                    .map_err(|_| invalid_line(line))?;
                if rest.starts_with(">>>>") {
                    entries.push(TraceEntry::Write { timestamp, data });
                } else {
                    entries.push(TraceEntry::Read { timestamp, data });
                }
            } else {
                return Err(invalid_line(line));
            }
        }

        Ok(TracePlayer {
            entries,
            index: 0,
            read_buffer: None,
            next_timestamp: 0.0,
            read_delay: Duration::ZERO,
        })
    }

    /// Whether every recorded entry has been consumed.
    pub fn is_finished(&self) -> bool {
        self.index >= self.entries.len()
    }

    fn next_entry(&mut self) -> TraceEntry {
        let entry = self
            .entries
            .get(self.index)
            .cloned()
            .expect("ran out of trace entries");
        self.index += 1;
        if let Some(next) = self.entries.get(self.index) {
            self.next_timestamp = next.timestamp();
        }
        entry
    }
}

fn invalid_line(line: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unrecognized trace line: {line}"),
    )
}

impl SerialTransport for TracePlayer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let exhausted = self
            .read_buffer
            .as_ref()
            .map_or(true, |(data, pos)| *pos >= data.len());
        if exhausted {
            if !self.read_delay.is_zero() {
                sleep(self.read_delay);
                self.read_delay = Duration::ZERO;
                return Ok(0);
            }
            let (timestamp, data) = match self.next_entry() {
                TraceEntry::Read { timestamp, data } => (timestamp, data),
                other => {
                    panic!("expected the host to read, but the trace continues with {other:?}")
                }
            };
            let gap = (self.next_timestamp - timestamp).max(0.0);
            self.read_delay = Duration::from_millis((gap * READ_DELAY_SCALE * 1000.0).round() as u64);
            self.read_buffer = Some((data, 0));
        }

        let (data, pos) = self.read_buffer.as_mut().unwrap();
        let count = buf.len().min(data.len() - *pos);
        buf[..count].copy_from_slice(&data[*pos..*pos + count]);
        *pos += count;
        Ok(count)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let (timestamp, data) = match self.next_entry() {
            TraceEntry::Write { timestamp, data } => (timestamp, data),
            other => panic!("expected the host to write, but the trace continues with {other:?}"),
        };
        assert_eq!(
            hex_dump(buf),
            hex_dump(&data),
            "write data mismatch at [{timestamp:.3}]"
        );
        // anything the device sent before this write is stale now
        self.read_buffer = None;
        Ok(())
    }

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> io::Result<()> {
        let (timestamp, expected_dtr, expected_rts) = match self.next_entry() {
            TraceEntry::ControlLines {
                timestamp,
                dtr,
                rts,
            } => (timestamp, dtr, rts),
            other => {
                panic!("expected a control line change, but the trace continues with {other:?}")
            }
        };
        assert_eq!(
            (dtr, rts),
            (expected_dtr, expected_rts),
            "control line mismatch at [{timestamp:.3}]"
        );
        sleep(Duration::from_secs_f64(
            (self.next_timestamp - timestamp).max(0.0),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_logs_frames_and_control_lines() {
        struct Loopback(Vec<u8>);
        impl SerialTransport for Loopback {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                let count = buf.len().min(self.0.len());
                let tail = self.0.split_off(count);
                buf[..count].copy_from_slice(&self.0);
                self.0 = tail;
                Ok(count)
            }
            fn write(&mut self, _buf: &[u8]) -> io::Result<()> {
                Ok(())
            }
            fn set_control_lines(&mut self, _dtr: bool, _rts: bool) -> io::Result<()> {
                Ok(())
            }
        }

        let mut log = Vec::new();
        {
            let mut recorder =
                TraceRecorder::new(Loopback(vec![0xC0, 0x01, 0x02, 0xC0]), &mut log);
            recorder.set_control_lines(true, false).unwrap();
            recorder.write(&[0xC0, 0xAA, 0xBB, 0xC0]).unwrap();
            let mut buf = [0u8; 8];
            recorder.read(&mut buf).unwrap();
        }

        let text = String::from_utf8(log).unwrap();
        let mut lines = text.lines();
        assert!(lines
            .next()
            .unwrap()
            .ends_with("SET_CONTROL_LINES DTR=true RTS=false"));
        assert!(lines.next().unwrap().contains(">>>> (     4): C0 AA BB C0"));
        assert!(lines.next().unwrap().contains("<<<< (     4): C0 01 02 C0"));
        assert!(lines.next().is_none());
    }

    #[test]
    fn player_round_trips_a_recording() {
        let trace = "\
[  0.001] SET_CONTROL_LINES DTR=true RTS=false
[  0.002] >>>> (     4): C0 AA BB C0
[  0.003] <<<< (     4): C0 01 02 C0
";
        let mut player = TracePlayer::parse(trace).unwrap();
        player.set_control_lines(true, false).unwrap();
        player.write(&[0xC0, 0xAA, 0xBB, 0xC0]).unwrap();
        let mut buf = [0u8; 8];
        let read = player.read(&mut buf).unwrap();
        assert_eq!(&buf[..read], &[0xC0, 0x01, 0x02, 0xC0]);
        assert!(player.is_finished());
    }

    #[test]
    #[should_panic(expected = "write data mismatch")]
    fn player_rejects_diverging_writes() {
        let trace = "[0.000] >>>> (     2): C0 C0\n";
        let mut player = TracePlayer::parse(trace).unwrap();
        player.write(&[0xC0, 0x00, 0xC0]).unwrap();
    }

    #[test]
    #[should_panic(expected = "control line mismatch")]
    fn player_rejects_diverging_control_lines() {
        let trace = "[0.000] SET_CONTROL_LINES DTR=false RTS=true\n";
        let mut player = TracePlayer::parse(trace).unwrap();
        player.set_control_lines(true, false).unwrap();
    }

    #[test]
    fn parser_rejects_garbage() {
        assert!(TracePlayer::parse("[0.0] ???? junk\n").is_err());
        assert!(TracePlayer::parse("no timestamp\n").is_err());
    }
}
