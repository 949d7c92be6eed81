use std::fmt;

use bytes::{Buf, BytesMut};

/// A live-progress report from the transcoder.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    /// Elapsed output time, `HH:MM:SS.xx`.
    pub time: String,
    pub fps: String,
    pub bitrate: String,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LIVE: {} | FPS: {} | Bitrate: {}", self.time, self.fps, self.bitrate)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Progress(Progress),
    Error(String),
}

const NOT_AVAILABLE: &str = "N/A";

/// Classifies one diagnostic line.
///
/// A progress line carries both `frame=` and `time=`; the `key=value` fields
/// may have spaces after `=` (ffmpeg right-aligns numbers). Failing that, a
/// line mentioning "error" in any case is an error. Everything else is noise.
pub fn parse_line(line: &str) -> Option<RelayEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if line.contains("frame=") && line.contains("time=") {
        let time = field(line, "time")
            .filter(|t| is_clock(t))
            .unwrap_or(NOT_AVAILABLE);
        let fps = field(line, "fps")
            .filter(|v| v.bytes().all(|b| b.is_ascii_digit() || b == b'.'))
            .unwrap_or(NOT_AVAILABLE);
        let bitrate = field(line, "bitrate")
            .filter(|v| v.ends_with("kbits/s"))
            .unwrap_or(NOT_AVAILABLE);
        return Some(RelayEvent::Progress(Progress {
            time: time.to_string(),
            fps: fps.to_string(),
            bitrate: bitrate.to_string(),
        }));
    }

    if line.to_ascii_lowercase().contains("error") {
        return Some(RelayEvent::Error(line.to_string()));
    }
    None
}

/// Value of `key=` in a progress line, skipping padding after the `=`.
fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let mut rest = line;
    while let Some(pos) = rest.find(key) {
        let at_boundary = pos == 0 || rest.as_bytes()[pos - 1].is_ascii_whitespace();
        let after = &rest[pos + key.len()..];
        if at_boundary {
            if let Some(value) = after.strip_prefix('=') {
                let value = value.trim_start();
                let end = value.find(char::is_whitespace).unwrap_or(value.len());
                return Some(&value[..end]).filter(|v| !v.is_empty());
            }
        }
        rest = after;
    }
    None
}

fn is_clock(value: &str) -> bool {
    let parts: Vec<&str> = value.split(':').collect();
    parts.len() == 3
        && parts[..2]
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
        && parts[2]
            .split_once('.')
            .is_some_and(|(s, frac)| {
                !s.is_empty()
                    && !frac.is_empty()
                    && s.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit())
            })
}

/// Reassembles lines from arbitrarily chunked output.
///
/// Both `\n` and `\r` end a line, since progress updates are rewritten in
/// place with a bare carriage return.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: BytesMut,
}

impl LineSplitter {
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete non-empty line, if one is buffered.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let end = self.buf.iter().position(|&b| b == b'\n' || b == b'\r')?;
            let line = self.buf.split_to(end);
            self.buf.advance(1);
            if !line.is_empty() {
                return Some(String::from_utf8_lossy(&line).into_owned());
            }
        }
    }

    /// Whatever trails the last terminator once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = self.buf.split();
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_padded_progress_line() {
        let line = "frame=  250 fps= 25 q=28.0 size=    1536kB time=00:00:10.00 bitrate=1258.3kbits/s speed=1.00x";
        assert_eq!(
            parse_line(line),
            Some(RelayEvent::Progress(Progress {
                time: "00:00:10.00".into(),
                fps: "25".into(),
                bitrate: "1258.3kbits/s".into(),
            }))
        );
    }

    #[test]
    fn missing_progress_fields_are_not_available() {
        let line = "frame=    0 fps=0.0 q=0.0 size=       0kB time=N/A bitrate=N/A speed=N/A";
        let Some(RelayEvent::Progress(p)) = parse_line(line) else {
            panic!("expected progress");
        };
        assert_eq!(p.time, "N/A");
        assert_eq!(p.fps, "0.0");
        assert_eq!(p.bitrate, "N/A");
        assert_eq!(p.to_string(), "LIVE: N/A | FPS: 0.0 | Bitrate: N/A");
    }

    #[test]
    fn keys_inside_longer_keys_are_skipped() {
        assert_eq!(
            field("frame=1 maxrate=5 time=00:00:01.00 bitrate=9.0kbits/s", "bitrate"),
            Some("9.0kbits/s")
        );
        assert_eq!(field("frame=1 runtime=3 time=00:00:01.00", "time"), Some("00:00:01.00"));
    }

    #[test]
    fn error_lines_are_case_insensitive() {
        assert_eq!(
            parse_line("[rtmp @ 0x55d] Server error: Connection refused\n"),
            Some(RelayEvent::Error("[rtmp @ 0x55d] Server error: Connection refused".into()))
        );
        assert!(matches!(
            parse_line("Error opening output rtmps://example/s/key"),
            Some(RelayEvent::Error(_))
        ));
        assert_eq!(parse_line("Stream mapping:"), None);
        assert_eq!(parse_line("   "), None);
    }

    #[test]
    fn splits_on_carriage_returns_across_chunks() {
        let mut splitter = LineSplitter::default();
        splitter.push(b"frame=1 time=00:00:00.04\rframe=2 ti");
        assert_eq!(splitter.next_line().as_deref(), Some("frame=1 time=00:00:00.04"));
        assert_eq!(splitter.next_line(), None);

        splitter.push(b"me=00:00:00.08\r\nInput #0\n");
        assert_eq!(splitter.next_line().as_deref(), Some("frame=2 time=00:00:00.08"));
        assert_eq!(splitter.next_line().as_deref(), Some("Input #0"));
        assert_eq!(splitter.next_line(), None);
        assert_eq!(splitter.finish(), None);

        splitter.push(b"tail");
        assert_eq!(splitter.finish().as_deref(), Some("tail"));
    }
}
