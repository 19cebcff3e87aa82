use std::{
    io::{self, BufRead, BufReader, Read},
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    thread,
    time::{Duration, Instant},
};

use crate::interrupt::{Cancelled, Interrupt};

/// How often a waiting reader checks for an interrupt.
const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of waiting for the next line of a streamed body.
#[derive(Debug)]
pub(crate) enum ReadEvent {
    /// Raw line without the trailing newline.
    Line(Vec<u8>),

    /// Body ended.
    Closed,

    /// No data arrived within the idle timeout.
    Idle,

    /// Reading the body failed.
    Failed(io::Error),

    /// Interrupt was raised while waiting.
    Cancelled(Cancelled),
}

/// Newline-delimited body read on a background thread.
///
/// The blocking read happens off the calling thread, so a waiting caller notices
/// interrupts and idle connections without a total request deadline. The reader
/// thread exits once the body ends or the receiving side is dropped and the next
/// line arrives.
pub(crate) struct LineReader {
    lines: Receiver<io::Result<Vec<u8>>>,
    interrupt: Interrupt,
}

impl LineReader {
    pub(crate) fn spawn<R>(body: R, interrupt: Interrupt) -> Self
    where
        R: Read + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel();

        thread::spawn(move || {
            for line in BufReader::new(body).split(b'\n') {
                let failed = line.is_err();

                if sender.send(line).is_err() || failed {
                    break;
                }
            }
        });

        Self {
            lines: receiver,
            interrupt,
        }
    }

    /// Wait for the next line for at most `idle`.
    pub(crate) fn next_event(&self, idle: Duration) -> ReadEvent {
        let deadline = Instant::now() + idle;

        loop {
            if let Err(cancelled) = self.interrupt.check() {
                return ReadEvent::Cancelled(cancelled);
            }

            let now = Instant::now();

            if now >= deadline {
                return ReadEvent::Idle;
            }

            match self
                .lines
                .recv_timeout((deadline - now).min(INTERRUPT_POLL_INTERVAL))
            {
                Ok(Ok(line)) => return ReadEvent::Line(line),
                Ok(Err(error)) => return ReadEvent::Failed(error),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return ReadEvent::Closed,
            }
        }
    }
}
