//! Property-based invariants of label edits.
//!
//! 1. Objects, region properties and annotation rows agree after any edit
//! 2. Undo restores the exact pre-edit labels and rows
//! 3. Sequential relabel is idempotent and ends at `max ID == object count`

use std::collections::BTreeSet;

use acdc::config::{AppConfig, ConfigStore};
use acdc::edit::{BrushStroke, EraserStroke};
use acdc::io::metadata::PositionMetadata;
use acdc::position::{Position, PositionLayout};
use acdc::prompt::AutoAccept;
use acdc::{CellId, Engine, Labels};
use acdc_labels::raster::Point;
use acdc_labels::unique_ids;
use proptest::prelude::*;

const SIZE: usize = 12;

// ----------------------------------------------------------------------------
// Strategies
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Op {
    Brush { x: f64, y: f64, radius: f64 },
    Erase { x: f64, y: f64, radius: f64 },
    Delete(CellId),
    Merge(CellId, CellId),
}

fn coord() -> impl Strategy<Value = f64> {
    (0..SIZE).prop_map(|v| v as f64)
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (coord(), coord(), 0.0..3.0f64).prop_map(|(x, y, radius)| Op::Brush { x, y, radius }),
        2 => (coord(), coord(), 0.0..3.0f64).prop_map(|(x, y, radius)| Op::Erase { x, y, radius }),
        1 => (1u32..8).prop_map(Op::Delete),
        1 => (1u32..8, 1u32..8).prop_map(|(a, b)| Op::Merge(a, b)),
    ]
}

fn engine() -> Engine {
    let meta = PositionMetadata::new_2d(1, SIZE, SIZE, "phase");
    let pos = Position::from_frames(
        meta,
        PositionLayout::new("/nonexistent", "pos", ""),
        vec![Labels::zeros((1, SIZE, SIZE))],
    );
    let mut config = AppConfig::default();
    config.autosave.enabled = false;
    config.undo_depth = 64;
    Engine::new(vec![pos], ConfigStore::in_memory(config), Box::new(AutoAccept)).unwrap()
}

/// Apply `op`; errors from IDs that are absent or equal are expected.
fn apply(engine: &mut Engine, op: &Op) -> bool {
    let result = match op {
        Op::Brush { x, y, radius } => engine
            .brush(&BrushStroke::new(Point::new(*x, *y), *radius))
            .map(|id| id.is_some()),
        Op::Erase { x, y, radius } => engine.erase(&EraserStroke::new(Point::new(*x, *y), *radius)),
        Op::Delete(id) => engine.delete_ids(BTreeSet::from([*id]), None).map(|(changed, _)| changed),
        Op::Merge(into, from) => engine.merge(*into, &[*from]),
    };
    result.unwrap_or(false)
}

fn snapshot(engine: &Engine) -> (Labels, Vec<CellId>) {
    let slot = engine.slot().unwrap();
    (slot.labels.clone(), slot.acdc.ids().collect())
}

// ============================================================================
// 1. Objects, properties and rows agree
// ============================================================================

proptest! {
    #[test]
    fn rows_match_objects_after_any_edit(ops in prop::collection::vec(op_strategy(), 1..25)) {
        let mut engine = engine();
        for op in &ops {
            apply(&mut engine, op);
            let slot = engine.slot().unwrap();
            let present: Vec<CellId> = unique_ids(&slot.labels).into_iter().collect();
            prop_assert_eq!(slot.state.ids(), present.as_slice());
            let rows: Vec<CellId> = slot.acdc.ids().collect();
            prop_assert_eq!(rows, present);
            prop_assert!(engine.position().check_frame_consistency(0).is_ok());
            prop_assert!(engine.position().brush_id() > acdc_labels::max_id(&slot.labels));
        }
    }
}

// ============================================================================
// 2. Undo is the inverse of a single edit
// ============================================================================

proptest! {
    #[test]
    fn undo_restores_previous_state(
        setup in prop::collection::vec(op_strategy(), 0..10),
        op in op_strategy(),
    ) {
        let mut engine = engine();
        for step in &setup {
            apply(&mut engine, step);
        }
        let before = snapshot(&engine);
        if apply(&mut engine, &op) {
            prop_assert!(engine.undo().unwrap());
            prop_assert_eq!(snapshot(&engine), before);
        } else {
            prop_assert_eq!(snapshot(&engine), before);
        }
    }
}

// ============================================================================
// 3. Relabel is idempotent
// ============================================================================

proptest! {
    #[test]
    fn relabel_twice_equals_once(ops in prop::collection::vec(op_strategy(), 1..20)) {
        let mut engine = engine();
        for op in &ops {
            apply(&mut engine, op);
        }
        let areas_before: BTreeSet<usize> = engine.slot().unwrap().state.props().iter().map(|p| p.area).collect();

        engine.relabel().unwrap();
        let once = snapshot(&engine);
        let count = once.1.len() as CellId;
        prop_assert_eq!(acdc_labels::max_id(&once.0), count);
        let areas_after: BTreeSet<usize> = engine.slot().unwrap().state.props().iter().map(|p| p.area).collect();
        prop_assert_eq!(areas_after, areas_before);

        let mapping = engine.relabel().unwrap();
        prop_assert!(mapping.iter().all(|(old, new)| old == new));
        prop_assert_eq!(snapshot(&engine), once);
    }
}
