use std::sync::Arc;
use std::sync::atomic::{AtomicI16, Ordering};

use tokio::sync::mpsc;

/// Progress sink for one operation. Values are integers 0-100 and never go
/// backwards; a [`Progress::phase`] maps its own 0-100 onto a sub-range of
/// the parent.
#[derive(Debug, Clone)]
pub struct Progress {
    sender: Option<mpsc::UnboundedSender<u8>>,
    start: u8,
    end: u8,
    last: Arc<AtomicI16>,
}

impl Progress {
    #[must_use]
    pub fn new(sender: mpsc::UnboundedSender<u8>) -> Self {
        Self {
            sender: Some(sender),
            start: 0,
            end: 100,
            last: Arc::new(AtomicI16::new(-1)),
        }
    }

    #[must_use]
    pub fn silent() -> Self {
        Self {
            sender: None,
            start: 0,
            end: 100,
            last: Arc::new(AtomicI16::new(-1)),
        }
    }

    /// A child covering `start..=end` of this range.
    #[must_use]
    pub fn phase(&self, start: u8, end: u8) -> Self {
        Self {
            sender: self.sender.clone(),
            start: self.scale(start),
            end: self.scale(end.max(start)),
            last: Arc::clone(&self.last),
        }
    }

    pub fn report(&self, percent: u8) {
        let value = self.scale(percent);
        let previous = self.last.fetch_max(i16::from(value), Ordering::SeqCst);
        if i16::from(value) > previous
            && let Some(sender) = &self.sender
        {
            let _ = sender.send(value);
        }
    }

    pub fn complete(&self) {
        self.report(100);
    }

    fn scale(&self, percent: u8) -> u8 {
        let percent = u16::from(percent.min(100));
        let span = u16::from(self.end - self.start);
        let scaled = u16::from(self.start) + span * percent / 100;
        u8::try_from(scaled).unwrap_or(100)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::Progress;

    fn drain(rx: &mut mpsc::UnboundedReceiver<u8>) -> Vec<u8> {
        let mut values = Vec::new();
        while let Ok(value) = rx.try_recv() {
            values.push(value);
        }
        values
    }

    #[test]
    fn phases_map_into_parent_range() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let progress = Progress::new(tx);

        progress.phase(0, 33).report(100);
        let download = progress.phase(33, 66);
        download.report(0);
        download.report(50);
        progress.phase(66, 100).complete();

        assert_eq!(drain(&mut rx), vec![33, 49, 100]);
    }

    #[test]
    fn values_never_decrease() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let progress = Progress::new(tx);

        progress.report(40);
        progress.report(20);
        progress.report(40);
        progress.report(41);

        assert_eq!(drain(&mut rx), vec![40, 41]);
    }

    #[test]
    fn silent_progress_accepts_reports() {
        let progress = Progress::silent();
        progress.phase(10, 20).report(50);
        progress.complete();
    }
}
