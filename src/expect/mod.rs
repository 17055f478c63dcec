//! Streaming expect engine.
//!
//! An [`Expecter`] binds a compiled-pattern search to one byte source and a
//! growable buffer. Each `expect` call discards everything before the
//! previous match's end, then scans forward: first through the retained
//! tail, then by pulling fresh bytes from the source one rune at a time
//! until a pattern match completes. The unmatched prefix (the *payload*)
//! and the match region stay addressable until the next call.
//!
//! Pulling input rune-by-rune is a correctness property, not an
//! optimization: a scripted login must react to a prompt the instant it
//! appears, and bytes past the match belong to the next prompt.

pub mod regex;

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::{Arc, LazyLock, Mutex};

use anyhow::{Context, Result};

pub use regex::{Regex, RuneSource};

/// Process-wide cache of compiled patterns, keyed by the literal pattern
/// string. `expect_re` bypasses it for hot-path repeated patterns.
static PATTERN_CACHE: LazyLock<Mutex<HashMap<String, Arc<Regex>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn cached_compile(pattern: &str) -> Result<Arc<Regex>> {
    let mut cache = PATTERN_CACHE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(re) = cache.get(pattern) {
        return Ok(Arc::clone(re));
    }
    let re = Arc::new(Regex::compile(pattern).with_context(|| format!("compile pattern {pattern:?}"))?);
    cache.insert(pattern.to_owned(), Arc::clone(&re));
    Ok(re)
}

/// Incremental first-match searcher over a live byte source.
pub struct Expecter<R> {
    source: R,
    /// Everything read so far, minus what earlier matches discarded.
    /// Always valid UTF-8 up to its length: bytes are appended one decoded
    /// rune at a time.
    buf: Vec<u8>,
    /// Match bounds into `buf` from the last successful `expect`.
    mlo: usize,
    mhi: usize,
    /// One-rune unread slot: bytes of a rune whose tail had not arrived
    /// when the source last failed (timeout). Replayed before new reads.
    partial: Vec<u8>,
}

impl<R: Read> Expecter<R> {
    /// Bind the engine to a byte source for its lifetime.
    pub fn new(source: R) -> Self {
        Self {
            source,
            buf: Vec::new(),
            mlo: 0,
            mhi: 0,
            partial: Vec::with_capacity(4),
        }
    }

    /// Search for `pattern`, compiling through the process-wide cache.
    ///
    /// A compile failure is returned synchronously and leaves the engine
    /// state untouched; the caller may retry with a corrected pattern.
    /// Source exhaustion or timeout comes back unchanged (downcast to
    /// `io::Error` to inspect the kind).
    pub fn expect(&mut self, pattern: &str) -> Result<()> {
        let re = cached_compile(pattern)?;
        self.expect_re(&re)
    }

    /// Search with a precompiled pattern, skipping the cache lookup.
    pub fn expect_re(&mut self, re: &Regex) -> Result<()> {
        // Discard bytes consumed by the previous match; the retained tail
        // slides to offset zero and is re-searched before any new read.
        self.buf.drain(..self.mhi);
        self.mlo = 0;
        self.mhi = 0;

        let (lo, hi) = {
            let mut runes = BufferedRunes {
                buf: &mut self.buf,
                next: 0,
                partial: &mut self.partial,
                source: &mut self.source,
            };
            re.search_stream(&mut runes)
                .with_context(|| format!("expect {:?}", re.as_str()))?
        };
        self.mlo = lo;
        self.mhi = hi;
        Ok(())
    }

    /// Bytes preceding the last match (`buffer[0..mlo]`).
    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.mlo]
    }

    /// The matched bytes themselves (`buffer[mlo..mhi]`).
    pub fn match_bytes(&self) -> &[u8] {
        &self.buf[self.mlo..self.mhi]
    }

    /// Release the engine and recover the source.
    pub fn into_inner(self) -> R {
        self.source
    }
}

/// Rune feed for the search: replays the buffered tail first, then decodes
/// fresh runes from the source byte-by-byte, never reading further than
/// the rune the stepper asked for.
struct BufferedRunes<'a, R> {
    buf: &'a mut Vec<u8>,
    next: usize,
    partial: &'a mut Vec<u8>,
    source: &'a mut R,
}

impl<R: Read> RuneSource for BufferedRunes<'_, R> {
    fn next_rune(&mut self) -> io::Result<char> {
        if self.next < self.buf.len() {
            // Buffered tail is valid UTF-8 by construction.
            let ch = std::str::from_utf8(&self.buf[self.next..])
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "corrupt expect buffer"))?
                .chars()
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "corrupt expect buffer"))?;
            self.next += ch.len_utf8();
            return Ok(ch);
        }

        // Pull exactly one rune from the source, resuming any partially
        // received sequence from the unread slot.
        loop {
            let need = match self.partial.first() {
                None => 1,
                Some(&lead) => rune_width(lead)?,
            };
            while self.partial.len() < need {
                let mut byte = [0u8; 1];
                let n = self.source.read(&mut byte)?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "source closed during expect",
                    ));
                }
                self.partial.push(byte[0]);
            }
            // A lone lead byte: loop once more with its real width.
            if need == 1 && rune_width(self.partial[0])? > 1 {
                continue;
            }
            let ch = std::str::from_utf8(self.partial)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid UTF-8 from source"))?
                .chars()
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid UTF-8 from source"))?;
            self.buf.extend_from_slice(self.partial);
            self.partial.clear();
            self.next = self.buf.len();
            return Ok(ch);
        }
    }
}

fn rune_width(lead: u8) -> io::Result<usize> {
    match lead {
        0x00..=0x7f => Ok(1),
        0xc2..=0xdf => Ok(2),
        0xe0..=0xef => Ok(3),
        0xf0..=0xf4 => Ok(4),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "invalid UTF-8 lead byte from source",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn downcast_kind(err: &anyhow::Error) -> io::ErrorKind {
        err.downcast_ref::<io::Error>().expect("io error").kind()
    }

    #[test]
    fn first_match_precedence() {
        let mut exp = Expecter::new(Cursor::new("xaby"));
        exp.expect("a|ab").unwrap();
        assert_eq!(exp.payload(), b"x");
        assert_eq!(exp.match_bytes(), b"a");
    }

    #[test]
    fn payload_and_match_split() {
        let mut exp = Expecter::new(Cursor::new("login: user\npassword: "));
        exp.expect("login: ").unwrap();
        assert_eq!(exp.payload(), b"");
        assert_eq!(exp.match_bytes(), b"login: ");

        exp.expect("password: ").unwrap();
        assert_eq!(exp.payload(), b"user\n");
        assert_eq!(exp.match_bytes(), b"password: ");
    }

    /// Across any sequence of calls: payload(n) never overlaps match(n-1),
    /// and concatenating payload+match over all calls reproduces the source
    /// byte stream with nothing skipped or duplicated.
    #[test]
    fn compaction_preserves_every_byte_exactly_once() {
        let input = "aa>bb>cc>";
        let mut exp = Expecter::new(Cursor::new(input));
        let mut replayed = Vec::new();
        for _ in 0..3 {
            exp.expect(">").unwrap();
            replayed.extend_from_slice(exp.payload());
            replayed.extend_from_slice(exp.match_bytes());
        }
        assert_eq!(replayed, input.as_bytes());
    }

    #[test]
    fn retained_tail_is_searched_before_new_reads() {
        // First match commits mid-stream; the tail after it must satisfy
        // the next expect without touching the (exhausted) source.
        let mut exp = Expecter::new(Cursor::new("a-b-"));
        exp.expect("a-").unwrap();
        exp.expect("b-").unwrap();
        assert_eq!(exp.match_bytes(), b"b-");
    }

    #[test]
    fn eof_surfaces_unchanged() {
        let mut exp = Expecter::new(Cursor::new("no prompt here"));
        let err = exp.expect("\\$ ").unwrap_err();
        assert_eq!(downcast_kind(&err), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn compile_failure_leaves_state_intact() {
        let mut exp = Expecter::new(Cursor::new("ok> done"));
        exp.expect("ok> ").unwrap();

        let err = exp.expect("broken(").unwrap_err();
        assert!(err.to_string().contains("compile"), "unexpected: {err:#}");
        // Prior results still addressable, and the engine still works.
        assert_eq!(exp.match_bytes(), b"ok> ");
        exp.expect("done").unwrap();
        assert_eq!(exp.match_bytes(), b"done");
    }

    #[test]
    fn expect_re_skips_cache() {
        let re = Regex::compile("ready").unwrap();
        let mut exp = Expecter::new(Cursor::new("... ready."));
        exp.expect_re(&re).unwrap();
        assert_eq!(exp.payload(), b"... ");
    }

    #[test]
    fn multibyte_input_matches_cleanly() {
        let mut exp = Expecter::new(Cursor::new("héllo ↦ wörld"));
        exp.expect("↦").unwrap();
        assert_eq!(exp.payload(), "héllo ".as_bytes());
        assert_eq!(exp.match_bytes(), "↦".as_bytes());
    }

    /// A source that times out once mid-rune, then delivers the rest. The
    /// partial bytes must survive in the unread slot, not be lost.
    #[test]
    fn partial_rune_survives_timeout() {
        struct Stutter {
            script: Vec<Option<u8>>, // None = timeout
            at: usize,
        }
        impl Read for Stutter {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                match self.script.get(self.at) {
                    None => Ok(0),
                    Some(None) => {
                        self.at += 1;
                        Err(io::Error::new(io::ErrorKind::TimedOut, "not yet"))
                    }
                    Some(Some(b)) => {
                        self.at += 1;
                        buf[0] = *b;
                        Ok(1)
                    }
                }
            }
        }

        // "é" is 0xc3 0xa9; the timeout lands between the two bytes.
        let mut script: Vec<Option<u8>> = vec![Some(0xc3), None, Some(0xa9)];
        script.extend("!".bytes().map(Some));
        let mut exp = Expecter::new(Stutter { script, at: 0 });

        let err = exp.expect("é!").unwrap_err();
        assert_eq!(downcast_kind(&err), io::ErrorKind::TimedOut);

        // Retry completes the rune and the match, with no byte loss.
        exp.expect("é!").unwrap();
        assert_eq!(exp.match_bytes(), "é!".as_bytes());
    }
}
