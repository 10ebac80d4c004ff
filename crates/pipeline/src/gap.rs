//! Per-session sequence tracking and gap detection.

use crate::sample::Sample;

/// An inclusive range of sequence numbers missing from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceGap {
    pub session_id: Option<String>,
    pub from: u64,
    pub to: u64,
}

impl SequenceGap {
    /// Number of samples missing.
    pub fn missing(&self) -> u64 {
        self.to - self.from + 1
    }
}

/// How a sample moved the sequence tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GapObservation {
    /// The sample has no sequence number.
    Untracked,
    /// First sequenced sample seen.
    Started,
    /// The session id changed; tracking restarted without a gap.
    SessionReset { previous: Option<String> },
    Contiguous,
    Gap(SequenceGap),
    /// Duplicate or out-of-order sequence; tracking is unchanged.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Tracking {
    session_id: Option<String>,
    sequence: u64,
}

#[derive(Debug, Default)]
pub struct GapDetector {
    last: Option<Tracking>,
}

impl GapDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last.as_ref().map(|tracking| tracking.sequence)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.last
            .as_ref()
            .and_then(|tracking| tracking.session_id.as_deref())
    }

    pub fn observe(&mut self, sample: &Sample) -> GapObservation {
        let Some(sequence) = sample.sequence else {
            return GapObservation::Untracked;
        };
        let incoming = Tracking {
            session_id: sample.session_id.clone(),
            sequence,
        };

        let Some(last) = self.last.as_mut() else {
            self.last = Some(incoming);
            return GapObservation::Started;
        };

        if last.session_id != incoming.session_id {
            let previous = last.session_id.take();
            *last = incoming;
            return GapObservation::SessionReset { previous };
        }

        if sequence <= last.sequence {
            return GapObservation::Stale;
        }

        let expected = last.sequence + 1;
        last.sequence = sequence;
        if sequence == expected {
            GapObservation::Contiguous
        } else {
            GapObservation::Gap(SequenceGap {
                session_id: incoming.session_id,
                from: expected,
                to: sequence - 1,
            })
        }
    }

    /// Whether `sample` belongs to the tracked session without advancing its
    /// sequence. Does not change tracking.
    pub fn is_stale(&self, sample: &Sample) -> bool {
        match (&self.last, sample.sequence) {
            (Some(last), Some(sequence)) => {
                last.session_id == sample.session_id && sequence <= last.sequence
            }
            _ => false,
        }
    }

    /// Seed tracking from samples already in the buffer (e.g. after the
    /// initial historical fetch), using the newest sequenced one.
    pub fn prime<'a>(&mut self, samples: impl DoubleEndedIterator<Item = &'a Sample>) {
        let newest = samples
            .rev()
            .find_map(|sample| sample.sequence.map(|sequence| (sample, sequence)));
        if let Some((sample, sequence)) = newest {
            let newer = match &self.last {
                Some(last) if last.session_id == sample.session_id => sequence > last.sequence,
                _ => true,
            };
            if newer {
                self.last = Some(Tracking {
                    session_id: sample.session_id.clone(),
                    sequence,
                });
            }
        }
    }
}
