use std::ops::ControlFlow;
use std::path::PathBuf;

use super::ExtractFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMsg {
    ExtractImageBegin,
    ExtractTreeBegin,
    ExtractDirStructureBegin,
    ExtractDirStructureEnd,
    ExtractDentry,
    ExtractStreams,
    ApplyTimestamps,
    ExtractImageEnd,
    ExtractTreeEnd,
}

/// Snapshot handed to the progress callback.
#[derive(Debug, Clone, Default)]
pub struct ExtractProgress {
    pub image: u32,
    pub image_name: String,
    pub wim_path: Option<PathBuf>,
    /// Path inside the image being extracted, empty for the whole image.
    pub source_path: String,
    pub target: PathBuf,
    pub flags: ExtractFlags,
    pub num_streams: u64,
    pub total_bytes: u64,
    pub completed_bytes: u64,
    /// Set for `ExtractDentry` messages in verbose mode.
    pub cur_path: String,
}

/// Progress callback. Returning `ControlFlow::Break` aborts the extraction.
pub type ProgressFn<'a> = dyn FnMut(ProgressMsg, &ExtractProgress) -> ControlFlow<()> + 'a;

/// Next completed-bytes value at which a stream progress message is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Threshold {
    Pending(u64),
    Done,
}

impl Threshold {
    pub(crate) fn new(step: u64) -> Threshold {
        Threshold::Pending(step)
    }

    pub(crate) fn crossed(&self, completed: u64) -> bool {
        match self {
            Threshold::Pending(next) => completed >= *next,
            Threshold::Done => false,
        }
    }

    pub(crate) fn advance(&mut self, completed: u64, total: u64, step: u64) {
        *self = if completed >= total {
            Threshold::Done
        } else {
            Threshold::Pending(completed.saturating_add(step).min(total))
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_advances_monotonically() {
        let total = 1000;
        let step = total / 100;
        let mut t = Threshold::new(step);
        assert!(!t.crossed(5));
        assert!(t.crossed(10));
        t.advance(15, total, step);
        assert_eq!(t, Threshold::Pending(25));
        assert!(!t.crossed(20));
        t.advance(995, total, step);
        assert_eq!(t, Threshold::Pending(1000));
        t.advance(1000, total, step);
        assert_eq!(t, Threshold::Done);
        assert!(!t.crossed(u64::MAX));
    }

    #[test]
    fn zero_total_fires_once() {
        let mut t = Threshold::new(0);
        assert!(t.crossed(0));
        t.advance(0, 0, 0);
        assert_eq!(t, Threshold::Done);
    }
}
