use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Line-oriented log sink.
pub trait LineConsumer: Send + Sync {
    fn write_line(&self, line: &str) -> io::Result<()>;

    /// Flushes and releases the sink. Later writes fail.
    fn close(&self) -> io::Result<()>;
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "line consumer is closed")
}

/// Appends lines to a file, flushing after each one.
pub struct FileLineConsumer {
    writer: Mutex<Option<BufWriter<File>>>,
}

impl FileLineConsumer {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }
}

impl LineConsumer for FileLineConsumer {
    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let writer = guard.as_mut().ok_or_else(closed)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    fn close(&self) -> io::Result<()> {
        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        match guard.take() {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

/// Fans every line out to several sinks.
///
/// All sinks are attempted; the first error is reported.
pub struct CompositeLineConsumer {
    consumers: Vec<Arc<dyn LineConsumer>>,
}

impl CompositeLineConsumer {
    pub fn new(consumers: Vec<Arc<dyn LineConsumer>>) -> Self {
        Self { consumers }
    }
}

impl LineConsumer for CompositeLineConsumer {
    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut result = Ok(());
        for consumer in &self.consumers {
            if let Err(e) = consumer.write_line(line)
                && result.is_ok()
            {
                result = Err(e);
            }
        }
        result
    }

    fn close(&self) -> io::Result<()> {
        let mut result = Ok(());
        for consumer in &self.consumers {
            if let Err(e) = consumer.close()
                && result.is_ok()
            {
                result = Err(e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_consumer_appends_lines_and_rejects_writes_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine.logs");

        let consumer = FileLineConsumer::open(&path).unwrap();
        consumer.write_line("first").unwrap();
        consumer.write_line("second").unwrap();
        consumer.close().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
        assert!(consumer.write_line("third").is_err());
        // closing twice is harmless
        consumer.close().unwrap();
    }

    #[test]
    fn composite_writes_to_every_sink_even_if_one_fails() {
        let dir = tempfile::tempdir().unwrap();
        let broken = Arc::new(FileLineConsumer::open(dir.path().join("a")).unwrap());
        broken.close().unwrap();
        let healthy = Arc::new(FileLineConsumer::open(dir.path().join("b")).unwrap());

        let composite = CompositeLineConsumer::new(vec![broken, healthy.clone()]);
        assert!(composite.write_line("hello").is_err());

        healthy.close().unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("b")).unwrap(),
            "hello\n"
        );
    }
}
