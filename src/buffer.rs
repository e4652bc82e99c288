use std::io;

use crate::ResultType;

/* The compressed buffer initial size. */
const INITIAL_BUFFER_SIZE: usize = 32 * 1024;

/// Growable byte buffer holding one compressed frame.
///
/// The JPEG shim writes into it through `io::Write`; whenever the next
/// write would not fit, the capacity doubles and the already-emitted
/// prefix is kept in place. Ownership moves to the caller inside
/// `EncodeResult::Done`.
#[derive(Debug)]
pub struct VideoBuffer {
    data: Vec<u8>,
}

impl VideoBuffer {
    pub fn new() -> ResultType<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(INITIAL_BUFFER_SIZE)?;
        Ok(VideoBuffer { data })
    }

    /// The encoded JPEG byte stream.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    fn grow(&mut self) -> io::Result<()> {
        let additional = self.data.capacity().max(INITIAL_BUFFER_SIZE);
        self.data
            .try_reserve_exact(additional)
            .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e))
    }
}

impl io::Write for VideoBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        while self.data.capacity() - self.data.len() < buf.len() {
            self.grow()?;
        }
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn starts_empty_with_initial_capacity() {
        let buffer = VideoBuffer::new().unwrap();
        assert!(buffer.is_empty());
        assert!(buffer.capacity() >= INITIAL_BUFFER_SIZE);
    }

    #[test]
    fn keeps_written_prefix_across_growth() {
        let mut buffer = VideoBuffer::new().unwrap();
        let chunk: Vec<u8> = (0..=255).collect();
        for _ in 0..512 {
            buffer.write_all(&chunk).unwrap();
        }
        assert_eq!(buffer.len(), 512 * 256);
        assert_eq!(&buffer.data()[..256], &chunk[..]);
        assert_eq!(&buffer.data()[buffer.len() - 256..], &chunk[..]);
    }

    #[test]
    fn doubles_capacity_on_refill() {
        let mut buffer = VideoBuffer::new().unwrap();
        buffer.write_all(&vec![0u8; INITIAL_BUFFER_SIZE + 1]).unwrap();
        assert!(buffer.capacity() >= 2 * INITIAL_BUFFER_SIZE);
    }
}
