//! Quote selection and formatting.
//!
//! Picks one quote from a corpus and renders it into a reusable buffer,
//! optionally padded with blank lines and capped at the RFC 865 limit.

use crate::config::Config;
use crate::corpus::Corpus;
use bytes::BytesMut;
use chrono::{DateTime, Datelike, Local, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Maximum quote size in bytes (RFC 865).
pub const QUOTE_SIZE: usize = 512;

/// Formatting options taken from the configuration snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuoteOptions {
    /// Same quote all day instead of a new one per request
    pub daily: bool,
    /// Surround the quote with `\n` before and `\n\n` after
    pub pad: bool,
    /// Ignore the `QUOTE_SIZE` cap
    pub allow_big: bool,
}

impl From<&Config> for QuoteOptions {
    fn from(config: &Config) -> Self {
        Self {
            daily: config.daily,
            pad: config.pad,
            allow_big: config.allow_big,
        }
    }
}

/// Seed derived from the calendar day.
pub fn daily_seed(date: NaiveDate) -> u64 {
    ((date.year() as u64) << 16) | u64::from(date.ordinal())
}

fn seed_for(daily: bool, now: DateTime<Local>) -> u64 {
    if daily {
        daily_seed(now.date_naive())
    } else {
        now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp()) as u64
    }
}

/// Pick the index of a non-blank entry.
///
/// A random start index is probed forward, wrapping, until a non-blank
/// entry is found.
pub fn pick(corpus: &Corpus, seed: u64) -> Result<usize, SelectError> {
    let len = corpus.len();
    if len == 0 {
        return Err(SelectError::Empty);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let start = (rng.gen::<u64>() % len as u64) as usize;
    let mut index = start;

    loop {
        if corpus.get(index).is_some_and(|quote| !quote.is_empty()) {
            return Ok(index);
        }

        index = (index + 1) % len;
        if index == start {
            return Err(SelectError::Empty);
        }
    }
}

/// Selects quotes and renders them into a grow-only buffer.
///
/// One selector per worker; the buffer is overwritten by every call.
#[derive(Debug, Default)]
pub struct QuoteSelector {
    buffer: BytesMut,
}

impl QuoteSelector {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(QUOTE_SIZE),
        }
    }

    /// Select a quote for the current time and render it.
    pub fn select_and_format(
        &mut self,
        corpus: &Corpus,
        options: &QuoteOptions,
    ) -> Result<&[u8], SelectError> {
        let seed = seed_for(options.daily, Local::now());
        self.select_with_seed(corpus, options, seed)
    }

    /// Select a quote using an explicit seed and render it.
    pub fn select_with_seed(
        &mut self,
        corpus: &Corpus,
        options: &QuoteOptions,
        seed: u64,
    ) -> Result<&[u8], SelectError> {
        let index = pick(corpus, seed)?;
        let quote = corpus.get(index).ok_or(SelectError::Empty)?;
        self.render(quote, options);

        debug!(index, bytes = self.buffer.len(), "Selected quote");
        trace!(quote = %String::from_utf8_lossy(quote), "Sending quotation");

        Ok(&self.buffer[..])
    }

    /// The most recently rendered quote.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Padding is applied first, then the cap.
    fn render(&mut self, quote: &[u8], options: &QuoteOptions) {
        let pieces: [&[u8]; 3] = if options.pad {
            [b"\n", quote, b"\n\n"]
        } else {
            [b"", quote, b""]
        };

        let natural: usize = pieces.iter().map(|p| p.len()).sum();
        let limit = if !options.allow_big && natural > QUOTE_SIZE {
            warn!(
                length = natural,
                limit = QUOTE_SIZE,
                over = natural - QUOTE_SIZE,
                "Quote exceeds size limit, truncating"
            );
            QUOTE_SIZE
        } else {
            natural
        };

        self.buffer.clear();
        self.buffer.reserve(limit);

        let mut remaining = limit;
        for piece in pieces {
            let n = piece.len().min(remaining);
            self.buffer.extend_from_slice(&piece[..n]);
            remaining -= n;
        }
    }
}

/// Quote selection errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("Quotes file has no non-empty quotes")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::Divider;
    use std::collections::HashSet;

    const PADDED: QuoteOptions = QuoteOptions {
        daily: false,
        pad: true,
        allow_big: false,
    };

    const PLAIN: QuoteOptions = QuoteOptions {
        daily: false,
        pad: false,
        allow_big: false,
    };

    fn corpus(raw: &[u8], divider: Divider) -> Corpus {
        Corpus::parse(raw.to_vec(), divider).unwrap()
    }

    #[test]
    fn test_blank_line_never_selected() {
        let corpus = corpus(b"alpha\nbeta\n\ngamma\n", Divider::Line);
        let mut selector = QuoteSelector::new();
        let mut seen = HashSet::new();

        for seed in 0..256 {
            let out = selector.select_with_seed(&corpus, &PADDED, seed).unwrap();
            seen.insert(out.to_vec());
        }

        let expected: HashSet<Vec<u8>> = [&b"\nalpha\n\n"[..], b"\nbeta\n\n", b"\ngamma\n\n"]
            .iter()
            .map(|s| s.to_vec())
            .collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_percent_quotes_selected() {
        let corpus = corpus(b"one\n%\ntwo\n%\nthree", Divider::Percent);
        let mut selector = QuoteSelector::new();
        let mut seen = HashSet::new();

        for seed in 0..256 {
            let out = selector.select_with_seed(&corpus, &PLAIN, seed).unwrap();
            assert!(!out.windows(3).any(|w| w == b"\n%\n"));
            seen.insert(out.to_vec());
        }

        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_all_blank_is_empty() {
        let corpus = corpus(b"\n\n\n\n", Divider::Line);
        let mut selector = QuoteSelector::new();
        for seed in 0..16 {
            assert_eq!(
                selector.select_with_seed(&corpus, &PADDED, seed),
                Err(SelectError::Empty)
            );
        }
    }

    #[test]
    fn test_no_entries_is_empty() {
        let corpus = corpus(b"", Divider::Line);
        assert_eq!(pick(&corpus, 7), Err(SelectError::Empty));
    }

    #[test]
    fn test_whole_file_blank_is_empty() {
        let corpus = corpus(b"", Divider::File);
        assert_eq!(corpus.len(), 1);
        assert_eq!(pick(&corpus, 7), Err(SelectError::Empty));
    }

    #[test]
    fn test_single_quote_always_reachable() {
        let corpus = corpus(b"\n\n\nonly\n\n", Divider::Line);
        for seed in 0..32 {
            assert_eq!(pick(&corpus, seed), Ok(3));
        }
    }

    #[test]
    fn test_unpadded_output() {
        let corpus = corpus(b"hello world", Divider::File);
        let mut selector = QuoteSelector::new();
        let out = selector.select_with_seed(&corpus, &PLAIN, 1).unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn test_truncates_to_cap() {
        let quote = vec![b'x'; 600];
        let corpus = Corpus::parse(quote, Divider::File).unwrap();
        let mut selector = QuoteSelector::new();

        let out = selector.select_with_seed(&corpus, &PADDED, 1).unwrap();
        assert_eq!(out.len(), QUOTE_SIZE);
        assert_eq!(out[0], b'\n');
        assert!(out[1..].iter().all(|&b| b == b'x'));

        let out = selector.select_with_seed(&corpus, &PLAIN, 1).unwrap();
        assert_eq!(out.len(), QUOTE_SIZE);
    }

    #[test]
    fn test_padding_truncated_at_boundary() {
        let corpus = Corpus::parse(vec![b'y'; QUOTE_SIZE - 2], Divider::File).unwrap();
        let mut selector = QuoteSelector::new();

        let out = selector.select_with_seed(&corpus, &PADDED, 1).unwrap();
        assert_eq!(out.len(), QUOTE_SIZE);
        assert_eq!(out[0], b'\n');
        assert_eq!(out[QUOTE_SIZE - 1], b'\n');
        assert_eq!(out[QUOTE_SIZE - 2], b'y');
    }

    #[test]
    fn test_allow_big() {
        let corpus = Corpus::parse(vec![b'z'; 2000], Divider::File).unwrap();
        let mut selector = QuoteSelector::new();
        let options = QuoteOptions {
            allow_big: true,
            ..PADDED
        };

        let out = selector.select_with_seed(&corpus, &options, 1).unwrap();
        assert_eq!(out.len(), 2003);
        assert!(out.ends_with(b"z\n\n"));
    }

    #[test]
    fn test_cap_never_exceeded() {
        let mut selector = QuoteSelector::new();
        for size in [1, 100, 508, 509, 510, 511, 512, 513, 1024, 4096] {
            let corpus = Corpus::parse(vec![b'q'; size], Divider::File).unwrap();
            for options in [PADDED, PLAIN] {
                let out = selector.select_with_seed(&corpus, &options, 3).unwrap();
                assert!(out.len() <= QUOTE_SIZE, "size {size} pad {}", options.pad);
            }
        }
    }

    #[test]
    fn test_buffer_reused() {
        let big = Corpus::parse(vec![b'a'; 400], Divider::File).unwrap();
        let small = Corpus::parse(b"tiny".to_vec(), Divider::File).unwrap();
        let mut selector = QuoteSelector::new();

        selector.select_with_seed(&big, &PLAIN, 0).unwrap();
        let capacity = selector.buffer.capacity();

        selector.select_with_seed(&small, &PLAIN, 0).unwrap();
        assert_eq!(selector.buffer(), b"tiny");
        assert!(selector.buffer.capacity() >= capacity);
    }

    #[test]
    fn test_daily_seed_stable_within_day() {
        let corpus = corpus(b"a\nb\nc\nd\ne\nf\ng\nh\n", Divider::Line);
        let mut selector = QuoteSelector::new();
        let day = NaiveDate::from_ymd_opt(2024, 3, 14).unwrap();

        let first = selector
            .select_with_seed(&corpus, &PLAIN, daily_seed(day))
            .unwrap()
            .to_vec();
        let second = selector
            .select_with_seed(&corpus, &PLAIN, daily_seed(day))
            .unwrap()
            .to_vec();
        assert_eq!(first, second);
    }

    #[test]
    fn test_daily_seed_changes_across_days() {
        let start = NaiveDate::from_ymd_opt(2024, 12, 30).unwrap();
        let next = start.succ_opt().unwrap();
        let new_year = next.succ_opt().unwrap();
        assert_ne!(daily_seed(start), daily_seed(next));
        assert_ne!(daily_seed(next), daily_seed(new_year));

        let corpus = corpus(b"a\nb\nc\nd\ne\nf\ng\nh\n", Divider::Line);
        let mut selector = QuoteSelector::new();
        let mut seen = HashSet::new();
        let mut day = start;
        for _ in 0..60 {
            let out = selector
                .select_with_seed(&corpus, &PLAIN, daily_seed(day))
                .unwrap();
            seen.insert(out.to_vec());
            day = day.succ_opt().unwrap();
        }
        assert!(seen.len() > 1);
    }

    #[test]
    fn test_daily_select_same_day() {
        let corpus = corpus(b"a\nb\nc\nd\ne\nf\ng\nh\n", Divider::Line);
        let mut selector = QuoteSelector::new();
        let options = QuoteOptions {
            daily: true,
            ..PLAIN
        };

        // Only flaky if run across midnight.
        let first = selector.select_and_format(&corpus, &options).unwrap().to_vec();
        let second = selector.select_and_format(&corpus, &options).unwrap().to_vec();
        assert_eq!(first, second);
    }

    #[test]
    fn test_random_select_never_fails() {
        let corpus = corpus(b"a\n\nb\n\n\nc\n", Divider::Line);
        let mut selector = QuoteSelector::new();
        for _ in 0..100 {
            let out = selector.select_and_format(&corpus, &PLAIN).unwrap();
            assert!(!out.is_empty());
        }
    }
}
