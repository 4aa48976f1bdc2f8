use bytes::{Buf, BytesMut};

/// Outcome of pulling one line out of the input queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRead {
    /// No terminator buffered yet; wait for more bytes.
    NotReady,
    /// No terminator within the scan window.
    TooLong,
    /// One line, terminator and trailing control characters removed.
    Line(String),
}

pub trait ReadLine {
    fn read_line(&mut self, limit: usize) -> LineRead;
}

impl ReadLine for BytesMut {
    /// Extract one `\n`-terminated line, looking at no more than `limit` bytes.
    fn read_line(&mut self, limit: usize) -> LineRead {
        let window = &self[..self.len().min(limit)];
        match window.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let mut end = pos;
                while end > 0 && self[end - 1] < 32 {
                    end -= 1;
                }
                let line = String::from_utf8_lossy(&self[..end]).into_owned();
                self.advance(pos + 1);
                LineRead::Line(line)
            }
            None if self.len() >= limit => LineRead::TooLong,
            None => LineRead::NotReady,
        }
    }
}
