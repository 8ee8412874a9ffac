//! Bounded capture of the runner's output streams

use std::io::Read;
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;

use crate::errors::Result;

const CHUNK_SIZE: usize = 8192;

/// Bytes read from one stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    /// Set when the stream produced more than the cap, or never reached EOF
    pub truncated: bool,
}

impl Captured {
    /// Lossy UTF-8 decode with surrounding whitespace removed
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).trim().to_string()
    }
}

/// Handle for a reader thread draining one pipe
pub struct StreamCapture {
    shared: Arc<Mutex<Captured>>,
    done: Receiver<()>,
}

impl StreamCapture {
    /// Wait until `deadline` for the stream to reach EOF and return what was read.
    ///
    /// A reader still blocked at `deadline` (a descendant kept the pipe open)
    /// is abandoned and the capture is flagged as truncated. Captures that
    /// share one deadline wait for it once in total, not once each.
    pub fn finish(self, deadline: Instant) -> Captured {
        let grace = deadline.saturating_duration_since(Instant::now());
        let finished = self.done.recv_timeout(grace).is_ok();

        let mut captured = std::mem::take(&mut *lock(&self.shared));
        if !finished {
            captured.truncated = true;
        }
        captured
    }
}

/// Spawn a reader thread that keeps at most `limit` bytes.
///
/// Bytes past the limit are read and discarded so that the writer never
/// blocks on a full pipe.
pub fn spawn_capture<R>(mut reader: R, limit: usize) -> Result<StreamCapture>
where
    R: Read + Send + 'static,
{
    let shared = Arc::new(Mutex::new(Captured::default()));
    let (tx, done) = channel();

    let sink = Arc::clone(&shared);
    thread::Builder::new()
        .name("sandbox-capture".to_string())
        .spawn(move || {
            let mut buf = [0u8; CHUNK_SIZE];
            loop {
                let n = match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                };

                let mut captured = lock(&sink);
                let room = limit.saturating_sub(captured.bytes.len());
                if n > room {
                    captured.truncated = true;
                }
                captured.bytes.extend_from_slice(&buf[..n.min(room)]);
            }
            let _ = tx.send(());
        })?;

    Ok(StreamCapture { shared, done })
}

fn lock(shared: &Mutex<Captured>) -> MutexGuard<'_, Captured> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    fn grace() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    /// Reader that never returns, like a pipe held open by an orphan
    struct Stalled;

    impl Read for Stalled {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            thread::sleep(Duration::from_secs(3600));
            Ok(0)
        }
    }

    #[test]
    fn test_capture_within_limit() {
        let capture = spawn_capture(Cursor::new(b"  hello\n".to_vec()), 1024).unwrap();
        let captured = capture.finish(grace());
        assert_eq!(captured.bytes, b"  hello\n");
        assert!(!captured.truncated);
        assert_eq!(captured.text(), "hello");
    }

    #[test]
    fn test_capture_truncates_past_limit() {
        let payload = vec![b'a'; CHUNK_SIZE * 3];
        let capture = spawn_capture(Cursor::new(payload), 100).unwrap();
        let captured = capture.finish(grace());
        assert_eq!(captured.bytes.len(), 100);
        assert!(captured.truncated);
    }

    #[test]
    fn test_exact_limit_is_not_truncated() {
        let capture = spawn_capture(Cursor::new(vec![b'b'; 64]), 64).unwrap();
        let captured = capture.finish(grace());
        assert_eq!(captured.bytes.len(), 64);
        assert!(!captured.truncated);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let capture = spawn_capture(Cursor::new(vec![b'o', b'k', 0xff]), 16).unwrap();
        assert_eq!(capture.finish(grace()).text(), "ok\u{fffd}");
    }

    #[test]
    fn test_stalled_reader_is_abandoned() {
        let capture = spawn_capture(Stalled, 16).unwrap();
        let captured = capture.finish(Instant::now() + Duration::from_millis(50));
        assert!(captured.bytes.is_empty());
        assert!(captured.truncated);
    }

    #[test]
    fn test_stalled_readers_share_one_deadline() {
        let captures = [
            spawn_capture(Stalled, 16).unwrap(),
            spawn_capture(Stalled, 16).unwrap(),
            spawn_capture(Stalled, 16).unwrap(),
        ];

        let started = Instant::now();
        let deadline = started + Duration::from_millis(200);
        for capture in captures {
            assert!(capture.finish(deadline).truncated);
        }
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
