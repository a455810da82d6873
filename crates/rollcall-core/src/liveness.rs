//! Blink-based liveness detection over eye-aspect-ratio signals.
//!
//! A static photograph held in front of the camera produces a flat EAR signal;
//! a live subject blinks, which shows up as the ratio dropping below a
//! threshold and recovering. Two modes are supported:
//!
//! - **Single frame**: "are the eyes closed right now" — a weak signal, kept
//!   for the cheap one-shot flow.
//! - **Frame sequence**: count open→closed transitions across ordered frames
//!   and require a minimum number of blinks. Edge detection means one long
//!   eye closure counts once, however many frames it spans.
//!
//! # Threat coverage
//!
//! - **Blocks:** printed photographs and other static images.
//! - **Does not block:** video replay of a blinking face or 3-D masks; the
//!   blink-count heuristic is the only liveness signal here.

/// Default EAR threshold below which an eye is considered closed.
pub const DEFAULT_EAR_THRESHOLD: f32 = 0.25;

/// Default number of blinks required for a frame sequence to pass.
pub const DEFAULT_REQUIRED_BLINKS: u32 = 2;

/// Minimum number of frames for multi-frame liveness. Fewer frames is a
/// caller error, not a liveness failure.
pub const MIN_SEQUENCE_FRAMES: usize = 3;

/// Single-frame check: true iff the combined EAR is below the threshold.
pub fn is_blinking(combined_ear: f32, threshold: f32) -> bool {
    combined_ear < threshold
}

/// Per-attempt blink state: the previous frame's EAR and the running count.
///
/// Owned by one verification attempt, fed frames in temporal order, and
/// discarded when the attempt concludes. Never persisted or shared.
#[derive(Debug, Default)]
pub struct BlinkCounter {
    previous_ear: Option<f32>,
    blink_count: u32,
}

impl BlinkCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the combined EAR of the next frame.
    ///
    /// A blink is counted exactly on the open→closed edge: the current EAR is
    /// below the threshold while the previous frame was open (or there was no
    /// previous measurement). `previous_ear` is updated unconditionally, so
    /// repeated closed frames do not re-count.
    ///
    /// Frames with no detected eyes must simply not be fed — skipping a frame
    /// leaves the state untouched.
    pub fn observe(&mut self, ear: f32, threshold: f32) {
        let closed = ear < threshold;
        let was_open = self.previous_ear.map_or(true, |prev| prev >= threshold);
        if closed && was_open {
            self.blink_count += 1;
        }
        self.previous_ear = Some(ear);
    }

    pub fn blink_count(&self) -> u32 {
        self.blink_count
    }
}

/// Outcome of scanning a frame sequence for blinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlinkReport {
    /// Open→closed edges observed.
    pub blink_count: u32,
    /// Frames with a usable EAR measurement.
    pub frames_analyzed: usize,
    /// Frames skipped because no face/eyes were detected.
    pub frames_skipped: usize,
}

impl BlinkReport {
    pub fn passes(&self, required_blinks: u32) -> bool {
        self.blink_count >= required_blinks
    }
}

/// Count blinks across an ordered sequence of per-frame combined EARs.
///
/// `None` entries are frames where detection missed; they are tolerated and
/// skipped without resetting the edge detector.
pub fn count_blinks<I>(ears: I, threshold: f32) -> BlinkReport
where
    I: IntoIterator<Item = Option<f32>>,
{
    let mut counter = BlinkCounter::new();
    let mut analyzed = 0usize;
    let mut skipped = 0usize;

    for ear in ears {
        match ear {
            Some(ear) => {
                counter.observe(ear, threshold);
                analyzed += 1;
            }
            None => skipped += 1,
        }
    }

    BlinkReport {
        blink_count: counter.blink_count(),
        frames_analyzed: analyzed,
        frames_skipped: skipped,
    }
}
