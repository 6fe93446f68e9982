//! Output decoding for spawned processes
//!
//! Raw chunks from either backend pass through an [`OutputCollector`], which
//! sniffs for binary data, decodes UTF-8 across chunk boundaries, strips
//! terminal escape sequences, and turns everything into output events.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;

use super::{OutputStream, ShellOutputEvent};

/// Bytes inspected before output is committed to being text
pub const SNIFF_LIMIT: usize = 4096;
/// A NUL byte within this prefix marks the output as binary
const BINARY_WINDOW: usize = 512;
/// Longest unterminated escape sequence held back for the next chunk
const MAX_HELD_ESCAPE: usize = 256;

fn ansi_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
            .expect("ansi regex must compile")
    })
}

fn unterminated_escape_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(r"\x1b(?:\[[0-?]*[ -/]*|\][^\x07\x1b]*\x1b?)?\z")
            .expect("unterminated escape regex must compile")
    })
}

/// Offset of a trailing fragment that may continue in the next chunk:
/// an unterminated escape sequence or a lone `\r`
fn held_back_from(text: &str) -> usize {
    if let Some(m) = unterminated_escape_regex().find(text) {
        if text.len() - m.start() <= MAX_HELD_ESCAPE {
            return m.start();
        }
    }
    if text.ends_with('\r') {
        text.len() - 1
    } else {
        text.len()
    }
}

/// Remove ANSI escape sequences and carriage returns before newlines
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    let stripped = ansi_regex().replace_all(text, "");
    if stripped.contains("\r\n") {
        Cow::Owned(stripped.replace("\r\n", "\n"))
    } else {
        stripped
    }
}

/// Whether a sniffed prefix looks like binary data
pub fn is_binary(prefix: &[u8]) -> bool {
    prefix.iter().take(BINARY_WINDOW).any(|b| *b == 0)
}

/// Conventional name for a signal number
pub fn signal_name(signal: i32) -> String {
    #[cfg(unix)]
    {
        let name = match signal {
            libc::SIGHUP => Some("SIGHUP"),
            libc::SIGINT => Some("SIGINT"),
            libc::SIGQUIT => Some("SIGQUIT"),
            libc::SIGABRT => Some("SIGABRT"),
            libc::SIGKILL => Some("SIGKILL"),
            libc::SIGSEGV => Some("SIGSEGV"),
            libc::SIGPIPE => Some("SIGPIPE"),
            libc::SIGALRM => Some("SIGALRM"),
            libc::SIGTERM => Some("SIGTERM"),
            _ => None,
        };
        if let Some(name) = name {
            return name.to_string();
        }
    }
    format!("SIG{}", signal)
}

/// Incremental UTF-8 decoder that holds back incomplete trailing sequences
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flush whatever is still buffered
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Accumulates process output and produces events
#[derive(Debug, Default)]
pub struct OutputCollector {
    stdout_decoder: Utf8Decoder,
    stderr_decoder: Utf8Decoder,
    stdout_held: String,
    stderr_held: String,
    sniffed: Vec<u8>,
    binary: bool,
    pub bytes_received: usize,
    pub stdout: String,
    pub stderr: String,
    /// Decoded text of both streams in arrival order
    pub output: String,
    pub raw_output: Vec<u8>,
}

impl OutputCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }

    /// Record one raw chunk and return the events it produces
    pub fn push(&mut self, stream: OutputStream, bytes: &[u8]) -> Vec<ShellOutputEvent> {
        self.bytes_received += bytes.len();
        self.raw_output.extend_from_slice(bytes);

        let mut events = Vec::new();

        if !self.binary && self.sniffed.len() < SNIFF_LIMIT {
            let take = (SNIFF_LIMIT - self.sniffed.len()).min(bytes.len());
            self.sniffed.extend_from_slice(&bytes[..take]);
            if is_binary(&self.sniffed) {
                self.binary = true;
                events.push(ShellOutputEvent::BinaryDetected);
            }
        }

        if self.binary {
            events.push(ShellOutputEvent::BinaryProgress {
                bytes_received: self.bytes_received,
            });
            return events;
        }

        let decoded = match stream {
            OutputStream::Stdout => self.stdout_decoder.decode(bytes),
            OutputStream::Stderr => self.stderr_decoder.decode(bytes),
        };
        if let Some(event) = self.append(stream, &decoded, false) {
            events.push(event);
        }
        events
    }

    /// Flush decoders once both streams have closed
    pub fn finish(&mut self) -> Vec<ShellOutputEvent> {
        if self.binary {
            return Vec::new();
        }
        let stdout_rest = self.stdout_decoder.finish();
        let stderr_rest = self.stderr_decoder.finish();
        [
            self.append(OutputStream::Stdout, &stdout_rest, true),
            self.append(OutputStream::Stderr, &stderr_rest, true),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    fn append(&mut self, stream: OutputStream, decoded: &str, flush: bool) -> Option<ShellOutputEvent> {
        let held = match stream {
            OutputStream::Stdout => &mut self.stdout_held,
            OutputStream::Stderr => &mut self.stderr_held,
        };
        let mut text = std::mem::take(held);
        text.push_str(decoded);
        if !flush {
            let split = held_back_from(&text);
            *held = text.split_off(split);
        }

        let chunk = strip_ansi(&text).into_owned();
        if chunk.is_empty() {
            return None;
        }
        match stream {
            OutputStream::Stdout => self.stdout.push_str(&chunk),
            OutputStream::Stderr => self.stderr.push_str(&chunk),
        }
        self.output.push_str(&chunk);
        Some(ShellOutputEvent::Data { stream, chunk })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m\r\n"), "red\n");
        assert_eq!(strip_ansi("\x1b]0;title\x07plain"), "plain");
        assert_eq!(strip_ansi("untouched"), "untouched");
    }

    #[test]
    fn test_escape_split_across_chunks() {
        let mut collector = OutputCollector::new();
        let mut events = collector.push(OutputStream::Stdout, b"\x1b[31");
        events.extend(collector.push(OutputStream::Stdout, b"mred\x1b[0m\r"));
        events.extend(collector.push(OutputStream::Stdout, b"\n"));
        events.extend(collector.finish());

        assert_eq!(collector.output, "red\n");
        assert!(events.iter().all(|event| match event {
            ShellOutputEvent::Data { chunk, .. } => !chunk.contains('\x1b') && !chunk.contains('\r'),
            _ => true,
        }));
    }

    #[test]
    fn test_held_fragment_flushed_at_finish() {
        let mut collector = OutputCollector::new();
        collector.push(OutputStream::Stderr, b"progress\r");
        assert_eq!(collector.stderr, "progress");

        collector.finish();
        assert_eq!(collector.stderr, "progress\r");
        assert_eq!(held_back_from("plain"), 5);
        assert_eq!(held_back_from("a\x1b]0;title"), 1);
    }

    #[test]
    fn test_decoder_handles_split_sequences() {
        let bytes = "héllo".as_bytes();
        let mut decoder = Utf8Decoder::default();
        let mut text = decoder.decode(&bytes[..2]); // splits 'é'
        text.push_str(&decoder.decode(&bytes[2..]));
        text.push_str(&decoder.finish());
        assert_eq!(text, "héllo");
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn test_binary_detection() {
        let mut collector = OutputCollector::new();
        let events = collector.push(OutputStream::Stdout, b"\x7fELF\x00\x01\x02");
        assert!(matches!(events[0], ShellOutputEvent::BinaryDetected));
        assert!(collector.is_binary());

        let events = collector.push(OutputStream::Stdout, b"more");
        assert!(matches!(
            events[..],
            [ShellOutputEvent::BinaryProgress { bytes_received: 11 }]
        ));
        assert!(collector.output.is_empty());
    }

    #[test]
    fn test_text_events_per_stream() {
        let mut collector = OutputCollector::new();
        collector.push(OutputStream::Stdout, b"out\n");
        collector.push(OutputStream::Stderr, b"err\n");
        assert_eq!(collector.stdout, "out\n");
        assert_eq!(collector.stderr, "err\n");
        assert_eq!(collector.output, "out\nerr\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(libc::SIGTERM), "SIGTERM");
        assert_eq!(signal_name(libc::SIGKILL), "SIGKILL");
        assert_eq!(signal_name(200), "SIG200");
    }
}
