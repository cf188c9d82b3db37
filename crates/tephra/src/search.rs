//! Interpolation search over timestamp-ordered indexes.
//!
//! Pages seed the search with their histogram and hand the narrowed
//! bracket to this module. The probe position is linearly interpolated
//! from the bracket's timestamps; a two-state automaton remembers
//! whether the previous probe overshot or undershot and biases the
//! next probe by the damped previous error (`prev_err >> step`). After
//! the quota is spent, or once the bracket is small, the caller
//! finishes with a binary search.

use crate::types::Timestamp;

/// Number of interpolation probes before falling back to binary search.
pub const SEARCH_QUOTA: u32 = 4;

/// Half-open index bracket `[begin, end]` into a timestamp-ordered
/// sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchRange {
    /// First candidate index.
    pub begin: u32,
    /// Last candidate index.
    pub end: u32,
}

/// Timestamp-ordered sequence the search can probe.
pub trait SearchWindow {
    /// Reads the timestamp at `ix`, or `None` past the end.
    fn read_at(&self, ix: u32) -> Option<Timestamp>;

    /// Returns true once the bracket is small enough that further
    /// interpolation cannot beat a plain binary search (for pages:
    /// both endpoints land on one OS page).
    fn is_small(&self, range: SearchRange) -> bool;
}

/// Counters reported to a [`SearchObserver`] after one interpolation
/// run.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterpolationRun {
    /// Probes spent.
    pub steps: u32,
    /// Probes that landed below the key.
    pub undershoots: u32,
    /// Probes that landed above the key.
    pub overshoots: u32,
    /// True if a probe hit the key exactly.
    pub exact_match: bool,
    /// True if the run ended because the bracket became small.
    pub reduced_to_small_range: bool,
}

/// Injected receiver for search diagnostics.
///
/// Implementations must tolerate concurrent calls from multiple
/// readers.
pub trait SearchObserver: Send + Sync {
    /// Reports a finished interpolation run.
    fn interpolation(&self, run: InterpolationRun);

    /// Reports a finished binary-search phase and its step count.
    fn binary_search(&self, steps: u32);
}

/// Observer that discards every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSearchObserver;

impl SearchObserver for NullSearchObserver {
    fn interpolation(&self, _run: InterpolationRun) {}

    fn binary_search(&self, _steps: u32) {}
}

/// Interpolation state automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeState {
    None,
    Undershoot,
    Overshoot,
}

/// Narrows `range` around `key` with up to [`SEARCH_QUOTA`] probes.
///
/// Returns `false` if the window refused a read (concurrent shrink);
/// the caller must abort the search. On success the bracket endpoints
/// both hold timestamps bounding `key`.
pub fn interpolation_search(
    window: &impl SearchWindow,
    key: Timestamp,
    range: &mut SearchRange,
    observer: &dyn SearchObserver,
) -> bool {
    if range.begin == range.end {
        return true;
    }
    let mut lower = match window.read_at(range.begin) {
        Some(ts) => ts,
        None => return false,
    };
    let mut upper = match window.read_at(range.end) {
        Some(ts) => ts,
        None => return false,
    };

    let mut run = InterpolationRun::default();
    let mut state = ProbeState::None;
    let mut prev_err: u64 = 0;
    let mut steps: u32 = 0;

    while steps < SEARCH_QUOTA {
        steps += 1;
        if window.is_small(*range) || lower == upper {
            run.reduced_to_small_range = true;
            break;
        }

        let numerator = match state {
            ProbeState::Undershoot => key - lower + (prev_err >> steps),
            ProbeState::Overshoot => (key - lower).saturating_sub(prev_err >> steps),
            ProbeState::None => key - lower,
        };

        // Widen before the multiply: ns timestamps times index widths
        // overflow 64 bits.
        let width = (range.end - range.begin) as u128;
        let span = (upper - lower) as u128;
        let position = range.begin as u64 + ((numerator as u128 * width) / span) as u64;

        if position <= range.begin as u64 || position >= range.end as u64 {
            break;
        }
        let probe_index = position as u32;

        let probe = match window.read_at(probe_index) {
            Some(ts) => ts,
            None => return false,
        };

        if probe < key {
            run.undershoots += 1;
            state = ProbeState::Undershoot;
            prev_err = key - probe;
            range.begin = probe_index;
            lower = match window.read_at(range.begin) {
                Some(ts) => ts,
                None => return false,
            };
        } else if probe > key {
            run.overshoots += 1;
            state = ProbeState::Overshoot;
            prev_err = probe - key;
            range.end = probe_index;
            upper = match window.read_at(range.end) {
                Some(ts) => ts,
                None => return false,
            };
        } else {
            run.exact_match = true;
            range.begin = probe_index;
            range.end = probe_index;
            break;
        }
    }

    run.steps = steps;
    observer.interpolation(run);
    true
}
