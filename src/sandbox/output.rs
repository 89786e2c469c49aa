use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Byte accumulator that silently stops growing at a fixed cap
#[derive(Debug)]
pub struct CappedBuffer {
    bytes: Vec<u8>,
    cap: usize,
}

impl CappedBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::new(),
            cap,
        }
    }

    /// Appends as much of `chunk` as fits, returns the number of bytes discarded
    pub fn push(&mut self, chunk: &[u8]) -> usize {
        let room = self.cap.saturating_sub(self.bytes.len());
        let take = room.min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..take]);
        chunk.len() - take
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Reads a stream to its end, keeping at most `cap` bytes
///
/// The pipe keeps being drained after the cap is hit so the child never
/// blocks on a full pipe. Cancelling `stop` returns what was collected so far.
pub(super) async fn read_capped<R>(
    mut reader: R,
    cap: usize,
    stop: CancellationToken,
) -> CappedBuffer
where
    R: AsyncRead + Unpin,
{
    let mut buffer = CappedBuffer::new(cap);
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    let mut discarded = 0usize;

    loop {
        let read = tokio::select! {
            read = reader.read(&mut chunk) => read,
            () = stop.cancelled() => break,
        };
        match read {
            Ok(0) => break,
            Ok(n) => discarded += buffer.push(&chunk[..n]),
            Err(e) => {
                log::debug!("Stopped reading child output: {e}");
                break;
            }
        }
    }

    if discarded > 0 {
        log::debug!("Discarded {discarded} bytes of output beyond the {cap} byte cap");
    }
    buffer
}
