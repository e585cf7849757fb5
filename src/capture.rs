//! This module contains all the capture logic

// The acquisition process appends `<time>\t<value>` lines to a log file with no
// synchronization with us. We tail that file with a byte cursor, only ever
// consuming whole lines, so a record that is still being flushed stays invisible
// until its newline lands. Samples are kept in memory, bounded, so a refresh never
// has to re-parse the whole file.

use std::{
    collections::VecDeque,
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, info, trace};

use crate::{
    error::{Error, Result},
    sample::{parse_line, DecimalSeparator, Sample, SampleBuffer},
};

/// A monotonically growing sequence of samples
pub trait SampleSource {
    /// Every sample currently available
    fn snapshot(&mut self) -> Result<SampleBuffer>;
    /// Whether the backing store exists and holds any data at all
    fn is_ready(&self) -> bool;
    /// Bumped whenever the source starts over, discarding what it held before
    fn generation(&self) -> u64 {
        0
    }
}

/// Tails an append-only log file
pub struct LogSource {
    path: PathBuf,
    decimal: DecimalSeparator,
    max_samples: usize,
    cursor: u64,
    samples: VecDeque<Sample>,
    dropped: usize,
    generation: u64,
}

impl LogSource {
    pub fn new(path: impl AsRef<Path>, decimal: DecimalSeparator) -> Self {
        Self {
            path: path.as_ref().to_owned(),
            decimal,
            max_samples: usize::MAX,
            cursor: 0,
            samples: VecDeque::new(),
            dropped: 0,
            generation: 0,
        }
    }

    /// Keep at most `max_samples` of the newest samples in memory
    pub fn with_max_samples(mut self, max_samples: usize) -> Self {
        self.max_samples = max_samples.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of complete lines that were discarded as malformed so far
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.samples.clear();
        self.generation += 1;
    }

    fn push(&mut self, line: &str) {
        match parse_line(line, self.decimal) {
            Ok(sample) => {
                if let Some(last) = self.samples.back() {
                    if sample.time <= last.time {
                        trace!(?line, "Dropping non-increasing timestamp");
                        self.dropped += 1;
                        return;
                    }
                }
                if self.samples.len() == self.max_samples {
                    self.samples.pop_front();
                }
                self.samples.push_back(sample);
            }
            Err(e) => {
                trace!("{e}");
                self.dropped += 1;
            }
        }
    }

    /// Pull every complete line appended since the last call
    fn poll(&mut self) -> Result<()> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            // Absent for now, keep whatever we had
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        if len < self.cursor {
            info!(path = ?self.path, "Log shrank, assuming a new acquisition run");
            self.reset();
        }
        if len == self.cursor {
            return Ok(());
        }
        file.seek(SeekFrom::Start(self.cursor))?;
        let mut bytes = Vec::with_capacity((len - self.cursor) as usize);
        file.take(len - self.cursor).read_to_end(&mut bytes)?;
        // Anything after the last newline is still being written
        let complete = match bytes.iter().rposition(|&b| b == b'\n') {
            Some(idx) => idx + 1,
            None => return Ok(()),
        };
        let chunk = String::from_utf8_lossy(&bytes[..complete]).into_owned();
        for line in chunk.lines() {
            if line.trim().is_empty() {
                continue;
            }
            self.push(line);
        }
        self.cursor += complete as u64;
        debug!(
            bytes = complete,
            samples = self.samples.len(),
            "Consumed new log data"
        );
        Ok(())
    }
}

impl SampleSource for LogSource {
    fn snapshot(&mut self) -> Result<SampleBuffer> {
        self.poll()?;
        Ok(SampleBuffer::new(self.samples.iter().copied().collect()))
    }

    fn is_ready(&self) -> bool {
        std::fs::metadata(&self.path)
            .map(|m| m.len() > 0)
            .unwrap_or(false)
    }

    fn generation(&self) -> u64 {
        self.generation
    }
}

/// In-memory source, fed by the caller
#[derive(Default)]
pub struct MemorySource {
    samples: Vec<Sample>,
    generation: u64,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    pub fn extend(&mut self, samples: impl IntoIterator<Item = Sample>) {
        self.samples.extend(samples);
    }

    /// Drop everything, as if acquisition had been restarted
    pub fn restart(&mut self) {
        self.samples.clear();
        self.generation += 1;
    }
}

impl SampleSource for MemorySource {
    fn snapshot(&mut self) -> Result<SampleBuffer> {
        Ok(SampleBuffer::new(self.samples.clone()))
    }

    fn is_ready(&self) -> bool {
        !self.samples.is_empty()
    }

    fn generation(&self) -> u64 {
        self.generation
    }
}

/// Block until `source` reports ready, polling every `poll`, for at most `timeout`
pub fn wait_until_ready<S: SampleSource>(
    source: &S,
    path: &Path,
    timeout: Duration,
    poll: Duration,
) -> Result<()> {
    let start = Instant::now();
    loop {
        if source.is_ready() {
            return Ok(());
        }
        let waited = start.elapsed();
        if waited >= timeout {
            return Err(Error::SourceUnavailable {
                path: path.to_owned(),
                waited,
            });
        }
        info!(?path, "Waiting for data");
        thread::sleep(poll.min(timeout - waited));
    }
}

/// Read a finished log in one go. Unlike [`LogSource`], a final line without a
/// newline is accepted when it parses.
pub fn read_log(path: impl AsRef<Path>, decimal: DecimalSeparator) -> Result<SampleBuffer> {
    let text = std::fs::read_to_string(path.as_ref())?;
    let mut samples: Vec<Sample> = Vec::new();
    let mut dropped = 0usize;
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        match parse_line(line, decimal) {
            Ok(s) if samples.last().map_or(true, |last| s.time > last.time) => samples.push(s),
            _ => dropped += 1,
        }
    }
    if dropped > 0 {
        debug!(dropped, "Skipped malformed lines");
    }
    Ok(SampleBuffer::new(samples))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn append(path: &Path, text: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn test_missing_log_is_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = LogSource::new(dir.path().join("data.txt"), DecimalSeparator::Comma);
        assert!(!source.is_ready());
        assert!(source.snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_torn_line_held_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        let mut source = LogSource::new(&path, DecimalSeparator::Comma);

        append(&path, "0,00\t0,010\n0,02\t0,011\n12,3\t");
        let snap = source.snapshot().unwrap();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.last().unwrap().time, 0.02);

        // Still torn: nothing new
        assert_eq!(source.snapshot().unwrap().len(), 2);

        append(&path, "0,012\n");
        let snap = source.snapshot().unwrap();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap.last().unwrap(), &Sample::new(12.3, 0.012));
        assert_eq!(source.dropped(), 0);
    }

    #[test]
    fn test_malformed_complete_line_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        let mut source = LogSource::new(&path, DecimalSeparator::Point);
        append(&path, "0.0\t1.0\n12.3\t\n0.1\t1.1\n0.05\t9.9\n");
        let snap = source.snapshot().unwrap();
        assert_eq!(snap.times(), vec![0.0, 0.1]);
        assert_eq!(source.dropped(), 2);
    }

    #[test]
    fn test_bounded_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        let mut source = LogSource::new(&path, DecimalSeparator::Point).with_max_samples(3);
        let text: String = (0..10).map(|i| format!("{i}\t{i}\n")).collect();
        append(&path, &text);
        assert_eq!(source.snapshot().unwrap().times(), vec![7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_truncated_log_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        let mut source = LogSource::new(&path, DecimalSeparator::Point);
        append(&path, "0\t1\n1\t1\n2\t1\n");
        assert_eq!(source.snapshot().unwrap().len(), 3);
        assert_eq!(source.generation(), 0);
        std::fs::write(&path, "0\t5\n").unwrap();
        let snap = source.snapshot().unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.first().unwrap().value, 5.0);
        assert_eq!(source.generation(), 1);
        // Plain growth is the same run
        append(&path, "1\t5\n");
        assert_eq!(source.snapshot().unwrap().len(), 2);
        assert_eq!(source.generation(), 1);
    }

    #[test]
    fn test_wait_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.txt");
        let source = LogSource::new(&path, DecimalSeparator::Comma);
        let err = wait_until_ready(
            &source,
            &path,
            Duration::from_millis(20),
            Duration::from_millis(5),
        )
        .unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable { .. }));
    }

    #[test]
    fn test_read_log_accepts_unterminated_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        append(&path, "0,0\t1,0\n0,1\t2,0\n0,2\t3,0");
        let buf = read_log(&path, DecimalSeparator::Comma).unwrap();
        assert_eq!(buf.len(), 3);
    }
}
