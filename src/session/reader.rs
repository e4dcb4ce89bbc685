//! Background reader: transport -> framer -> decoder -> channel.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::protocol::{FrameDecoder, LineFramer, Message};
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq)]
pub enum ReaderEvent {
    Message(Message),
    /// The link is dead; no further events follow.
    Disconnected(String),
}

/// Why the reader loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderExit {
    Stopped,
    ConsumerGone,
    Failed(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ReaderSettings {
    pub chunk_timeout: Duration,
    pub max_consecutive_errors: u32,
}

pub struct ReaderThread {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<ReaderExit>>,
}

impl ReaderThread {
    pub fn spawn(
        transport: Arc<dyn Transport>,
        framer: LineFramer,
        settings: ReaderSettings,
        events: mpsc::Sender<ReaderEvent>,
    ) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let running_flag = running.clone();
        let handle = thread::Builder::new()
            .name("pump-reader".into())
            .spawn(move || read_loop(transport, framer, settings, running_flag, events))?;
        Ok(Self { running, handle: Some(handle) })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Asks the loop to exit; it notices within one chunk timeout.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Stops the loop and waits for the thread.
    pub fn join(mut self) -> ReaderExit {
        self.stop();
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(exit)) => exit,
            Some(Err(_)) => ReaderExit::Failed("reader thread panicked".into()),
            None => ReaderExit::Stopped,
        }
    }
}

impl Drop for ReaderThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_loop(
    transport: Arc<dyn Transport>,
    mut framer: LineFramer,
    settings: ReaderSettings,
    running: Arc<AtomicBool>,
    events: mpsc::Sender<ReaderEvent>,
) -> ReaderExit {
    let mut decoder = FrameDecoder::new();
    let mut consecutive_errors = 0u32;
    log::debug!("Reader started ({:?} transport)", transport.kind());

    let exit = loop {
        if !running.load(Ordering::SeqCst) {
            break ReaderExit::Stopped;
        }
        let chunk = match transport.read_chunk(settings.chunk_timeout) {
            Ok(chunk) => {
                consecutive_errors = 0;
                chunk
            }
            Err(e) if e.is_fatal() => {
                log::error!("Link lost: {}", e);
                let _ = events.blocking_send(ReaderEvent::Disconnected(e.to_string()));
                break ReaderExit::Failed(e.to_string());
            }
            Err(e) => {
                consecutive_errors += 1;
                log::warn!("Read error {}/{}: {}", consecutive_errors, settings.max_consecutive_errors, e);
                if consecutive_errors >= settings.max_consecutive_errors {
                    let reason = format!("{} consecutive read errors, last: {}", consecutive_errors, e);
                    let _ = events.blocking_send(ReaderEvent::Disconnected(reason.clone()));
                    break ReaderExit::Failed(reason);
                }
                continue;
            }
        };

        let now = Instant::now();
        let mut frames = if chunk.is_empty() { Vec::new() } else { framer.push(&chunk, now) };
        frames.extend(framer.poll_timeout(now));

        let mut consumer_gone = false;
        for frame in frames {
            log::trace!("RX {:?}", frame.as_str());
            if let Some(message) = decoder.decode(&frame) {
                if events.blocking_send(ReaderEvent::Message(message)).is_err() {
                    consumer_gone = true;
                    break;
                }
            }
        }
        if consumer_gone {
            break ReaderExit::ConsumerGone;
        }
    };

    log::info!("Reader exited: {:?} ({} frames discarded)", exit, decoder.discarded());
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AckKind;
    use crate::transport::{TransferError, TransportKind};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted read results, then reports timeouts forever.
    struct ScriptedTransport {
        script: Mutex<VecDeque<crate::transport::Result<Vec<u8>>>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<crate::transport::Result<Vec<u8>>>) -> Arc<Self> {
            Arc::new(Self { script: Mutex::new(script.into()) })
        }
    }

    impl Transport for ScriptedTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Serial
        }

        fn write(&self, _bytes: &[u8]) -> crate::transport::Result<()> {
            Ok(())
        }

        fn read_chunk(&self, timeout: Duration) -> crate::transport::Result<Vec<u8>> {
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(result) => result,
                None => {
                    thread::sleep(timeout);
                    Ok(Vec::new())
                }
            }
        }

        fn close(&self) {}

        fn is_open(&self) -> bool {
            true
        }
    }

    fn settings() -> ReaderSettings {
        ReaderSettings { chunk_timeout: Duration::from_millis(5), max_consecutive_errors: 3 }
    }

    fn framer() -> LineFramer {
        LineFramer::new(Duration::from_millis(100), 4096)
    }

    #[test]
    fn delivers_messages_in_order_across_chunks() {
        let transport = ScriptedTransport::new(vec![
            Ok(b"ACK:ZE".to_vec()),
            Ok(b"RO_SET\nVOL:2".to_vec()),
            Ok(Vec::new()),
            Ok(b".5\nnoise\n".to_vec()),
        ]);
        let (tx, mut rx) = mpsc::channel(16);
        let reader = ReaderThread::spawn(transport, framer(), settings(), tx).unwrap();
        assert_eq!(rx.blocking_recv(), Some(ReaderEvent::Message(Message::Ack(AckKind::ZeroSet))));
        assert_eq!(rx.blocking_recv(), Some(ReaderEvent::Message(Message::Volume(2.5))));
        assert_eq!(reader.join(), ReaderExit::Stopped);
    }

    #[test]
    fn fatal_error_reports_disconnect() {
        let transport = ScriptedTransport::new(vec![Ok(b"VOL:1\n".to_vec()), Err(TransferError::Disconnected)]);
        let (tx, mut rx) = mpsc::channel(16);
        let reader = ReaderThread::spawn(transport, framer(), settings(), tx).unwrap();
        assert_eq!(rx.blocking_recv(), Some(ReaderEvent::Message(Message::Volume(1.0))));
        assert!(matches!(rx.blocking_recv(), Some(ReaderEvent::Disconnected(_))));
        assert!(matches!(reader.join(), ReaderExit::Failed(_)));
    }

    #[test]
    fn transient_errors_tolerated_until_limit() {
        let transient = || Err(TransferError::Io(std::io::Error::new(std::io::ErrorKind::Other, "glitch")));
        let transport = ScriptedTransport::new(vec![
            transient(),
            transient(),
            Ok(b"PROG:5\n".to_vec()),
            transient(),
            transient(),
            transient(),
        ]);
        let (tx, mut rx) = mpsc::channel(16);
        let reader = ReaderThread::spawn(transport, framer(), settings(), tx).unwrap();
        assert_eq!(rx.blocking_recv(), Some(ReaderEvent::Message(Message::Progress(5))));
        assert!(matches!(rx.blocking_recv(), Some(ReaderEvent::Disconnected(_))));
        assert!(matches!(reader.join(), ReaderExit::Failed(_)));
    }

    #[test]
    fn stop_is_observed_within_a_chunk_timeout() {
        let transport = ScriptedTransport::new(Vec::new());
        let (tx, _rx) = mpsc::channel(16);
        let reader = ReaderThread::spawn(transport, framer(), settings(), tx).unwrap();
        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        assert_eq!(reader.join(), ReaderExit::Stopped);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn dropped_consumer_ends_loop() {
        let transport = ScriptedTransport::new(vec![Ok(b"VOL:1\n".to_vec())]);
        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        let reader = ReaderThread::spawn(transport, framer(), settings(), tx).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(reader.join(), ReaderExit::ConsumerGone);
    }

    #[test]
    fn stalled_partial_line_is_flushed_by_deadline() {
        let transport = ScriptedTransport::new(vec![Ok(b"ACK:RESET".to_vec())]);
        let (tx, mut rx) = mpsc::channel(16);
        let reader = ReaderThread::spawn(transport, framer(), settings(), tx).unwrap();
        assert_eq!(rx.blocking_recv(), Some(ReaderEvent::Message(Message::Ack(AckKind::Reset))));
        reader.join();
    }
}
