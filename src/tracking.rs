//! Tracker bridge.
//!
//! A [`Tracker`] renumbers the objects of a frame so that they carry the IDs
//! of the matching objects of the previous frame. The bridge validates the
//! tracker output, turns it into an old-ID to new-ID mapping, and re-applies
//! the manual edit log so that operator assignments survive re-tracking.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use acdc_labels::{CellId, Labels, unique_ids};
use ndarray::ArrayView3;

use crate::config::TrackerChoice;
use crate::error::{EngineError, Result};
use crate::model::{IdChanges, ManualEditLog};

// ============================================================================
// Tracker trait
// ============================================================================

/// Frame-to-frame tracker.
///
/// Output IDs must be a subset of the IDs of `prev` plus fresh IDs above
/// `max(prev)`. `fresh_from` is the position's next unused ID and is a
/// lower bound for fresh IDs.
pub trait Tracker: Send {
    /// Name used to select the tracker in the settings.
    fn name(&self) -> &str;

    /// Renumber `curr` against `prev`.
    fn track_frame(
        &self,
        prev: &Labels,
        curr: &Labels,
        image: Option<ArrayView3<'_, f32>>,
        fresh_from: CellId,
    ) -> Result<Labels>;
}

/// Built-in tracker matching objects by overlap.
///
/// The overlap of a current object with a previous one is the shared area
/// divided by the area of the current object. Pairs above the threshold are
/// matched greedily, largest overlap first.
#[derive(Debug, Clone, Copy)]
pub struct OverlapTracker {
    /// Minimum overlap for a match
    pub threshold: f64,
}

impl OverlapTracker {
    /// Create a tracker with a matching threshold in `0..=1`.
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Old-ID to new-ID assignment for `curr`.
    pub fn assign(&self, prev: &Labels, curr: &Labels, fresh_from: CellId) -> BTreeMap<CellId, CellId> {
        let mut overlap: HashMap<(CellId, CellId), usize> = HashMap::new();
        let mut area: BTreeMap<CellId, usize> = BTreeMap::new();
        for (&c, &p) in curr.iter().zip(prev.iter()) {
            if c == 0 {
                continue;
            }
            *area.entry(c).or_default() += 1;
            if p > 0 {
                *overlap.entry((c, p)).or_default() += 1;
            }
        }

        let mut candidates: Vec<(f64, CellId, CellId)> = overlap
            .into_iter()
            .map(|((c, p), n)| (n as f64 / area[&c] as f64, c, p))
            .filter(|&(ioa, _, _)| ioa >= self.threshold)
            .collect();
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut assignment: BTreeMap<CellId, CellId> = BTreeMap::new();
        let mut used: BTreeSet<CellId> = BTreeSet::new();
        for (_, c, p) in candidates {
            if assignment.contains_key(&c) || used.contains(&p) {
                continue;
            }
            assignment.insert(c, p);
            used.insert(p);
        }

        let max_prev = acdc_labels::max_id(prev);
        let max_curr = area.keys().next_back().copied().unwrap_or(0);
        let mut next = fresh_from.max(max_curr + 1).max(max_prev + 1);
        for &c in area.keys() {
            if assignment.contains_key(&c) {
                continue;
            }
            let target = if c > max_prev && !used.contains(&c) {
                c
            } else {
                while used.contains(&next) {
                    next += 1;
                }
                next
            };
            assignment.insert(c, target);
            used.insert(target);
        }
        assignment
    }
}

impl Tracker for OverlapTracker {
    fn name(&self) -> &str {
        "overlap"
    }

    fn track_frame(
        &self,
        prev: &Labels,
        curr: &Labels,
        _image: Option<ArrayView3<'_, f32>>,
        fresh_from: CellId,
    ) -> Result<Labels> {
        if prev.dim() != curr.dim() {
            return Err(EngineError::invalid_input(format!(
                "cannot track {:?} against {:?}",
                curr.dim(),
                prev.dim()
            )));
        }
        let assignment = self.assign(prev, curr, fresh_from);
        Ok(curr.mapv(|v| if v == 0 { 0 } else { assignment.get(&v).copied().unwrap_or(v) }))
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Trackers available to the engine, looked up by name.
pub struct TrackerRegistry {
    trackers: Vec<Box<dyn Tracker>>,
}

impl TrackerRegistry {
    /// Registry with the built-in overlap tracker.
    pub fn new(overlap_threshold: f64) -> Self {
        Self {
            trackers: vec![Box::new(OverlapTracker::new(overlap_threshold))],
        }
    }

    /// Register a plug-in tracker; a tracker with the same name is replaced.
    pub fn register(&mut self, tracker: Box<dyn Tracker>) {
        log::info!("Registered tracker '{}'", tracker.name());
        self.trackers.retain(|t| t.name() != tracker.name());
        self.trackers.push(tracker);
    }

    /// Tracker for a settings choice.
    pub fn get(&self, choice: &TrackerChoice) -> Option<&dyn Tracker> {
        let name = match choice {
            TrackerChoice::Overlap => "overlap",
            TrackerChoice::Plugin(name) => name.as_str(),
        };
        self.trackers.iter().find(|t| t.name() == name).map(|t| t.as_ref())
    }

    /// Names of the registered trackers.
    pub fn names(&self) -> Vec<&str> {
        self.trackers.iter().map(|t| t.name()).collect()
    }
}

// ============================================================================
// Bridge
// ============================================================================

/// Track `curr` against `prev` and return the tracked labels with the
/// mapping from current to tracked IDs.
pub fn track(
    tracker: &dyn Tracker,
    prev: &Labels,
    curr: &Labels,
    image: Option<ArrayView3<'_, f32>>,
    fresh_from: CellId,
) -> Result<(Labels, BTreeMap<CellId, CellId>)> {
    let tracked = tracker.track_frame(prev, curr, image, fresh_from)?;
    if tracked.dim() != curr.dim() {
        return Err(EngineError::invalid_input(format!(
            "tracker '{}' returned shape {:?}, expected {:?}",
            tracker.name(),
            tracked.dim(),
            curr.dim()
        )));
    }

    let prev_ids = unique_ids(prev);
    let max_prev = prev_ids.last().copied().unwrap_or(0);
    if let Some(bad) = unique_ids(&tracked)
        .into_iter()
        .find(|id| *id <= max_prev && !prev_ids.contains(id))
    {
        return Err(EngineError::invalid_input(format!(
            "tracker '{}' produced ID {} which is neither in the previous frame nor fresh",
            tracker.name(),
            bad
        )));
    }

    let mut mapping = BTreeMap::new();
    for (&c, &t) in curr.iter().zip(tracked.iter()) {
        if c > 0 && t > 0 {
            mapping.entry(c).or_insert(t);
        }
    }
    mapping.retain(|a, b| a != b);
    Ok((tracked, mapping))
}

/// Re-apply the manual edit log to tracked labels.
///
/// For every entry whose pixel carries a different ID, the object is renamed
/// to the logged ID (swapping when that ID is already used). Returns the
/// composed mapping from the labels' IDs before the replay to after it.
pub fn replay_manual_edits(labels: &mut Labels, log: &ManualEditLog) -> BTreeMap<CellId, CellId> {
    let (depth, height, width) = labels.dim();
    let mut present = unique_ids(labels);
    let mut changes = IdChanges::none();
    for entry in log.entries() {
        let z = entry.z.unwrap_or(0).min(depth.saturating_sub(1));
        if entry.y >= height || entry.x >= width {
            continue;
        }
        let current = labels[[z, entry.y, entry.x]];
        if current == 0 || current == entry.new_id {
            continue;
        }
        let step = if present.contains(&entry.new_id) {
            IdChanges::swap(current, entry.new_id)
        } else {
            present.remove(&current);
            present.insert(entry.new_id);
            IdChanges::rename(current, entry.new_id)
        };
        acdc_labels::components::apply_mapping(labels, &step.mapping);
        log::debug!("Re-applied manual edit {} -> {}", current, entry.new_id);
        changes = changes.then(&step.mapping);
    }
    changes.mapping
}

// ============================================================================
// Smart toggle
// ============================================================================

/// Whether real-time tracking runs on a frame.
///
/// Until the operator toggles tracking explicitly, frames that were already
/// visited are not re-tracked and new frames are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackingToggle {
    user_choice: Option<bool>,
}

impl TrackingToggle {
    /// Whether tracking is enabled for a frame.
    pub fn enabled(&self, visited: bool) -> bool {
        self.user_choice.unwrap_or(!visited)
    }

    /// Pin the operator's choice (`None` returns to the automatic default).
    pub fn set(&mut self, choice: Option<bool>) {
        log::debug!("Tracking toggle set to {:?}", choice);
        self.user_choice = choice;
    }

    /// The pinned choice, if any.
    pub fn user_choice(&self) -> Option<bool> {
        self.user_choice
    }
}
