//! End-to-end editing sessions driven through the public engine API.

use std::collections::BTreeSet;

use acdc::config::{AppConfig, ConfigStore};
use acdc::edit::{BrushStroke, EraserStroke};
use acdc::io::metadata::PositionMetadata;
use acdc::io::npz::read_segmentation;
use acdc::io::table::read_table;
use acdc::model::{CellCycleStage, Relationship, RoiShape, check_symmetry};
use acdc::position::{Position, PositionLayout};
use acdc::prompt::AutoAccept;
use acdc::model::AcdcTable;
use acdc::{CellId, Engine, Labels, Mode, PropagationPolicy};
use acdc_labels::raster::Point;
use acdc_labels::unique_ids;

fn engine(dir: &std::path::Path, frames: Vec<Labels>) -> Engine {
    let (_, h, w) = frames[0].dim();
    let meta = PositionMetadata::new_2d(frames.len(), h, w, "phase");
    let pos = Position::from_frames(meta, PositionLayout::new(dir, "pos", ""), frames);
    engine_for(pos)
}

fn config() -> ConfigStore {
    let mut config = AppConfig::default();
    config.autosave.enabled = false;
    config.save_measurements = Some(false);
    ConfigStore::in_memory(config)
}

fn engine_for(pos: Position) -> Engine {
    Engine::new(vec![pos], config(), Box::new(AutoAccept)).unwrap()
}

fn square(labels: &mut Labels, id: CellId, y: usize, x: usize, side: usize) {
    for dy in 0..side {
        for dx in 0..side {
            labels[[0, y + dy, x + dx]] = id;
        }
    }
}

fn ids(labels: &Labels) -> Vec<CellId> {
    unique_ids(labels).into_iter().collect()
}

#[test]
fn brush_creates_then_eraser_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine(dir.path(), vec![Labels::zeros((1, 5, 5))]);
    assert_eq!(engine.mode(), Mode::Snapshot);

    let id = engine.brush(&BrushStroke::new(Point::new(2.0, 2.0), 1.0)).unwrap();
    assert_eq!(id, Some(1));
    let slot = engine.slot().unwrap();
    assert_eq!(slot.state.get(1).unwrap().area, 5);
    assert_eq!(slot.labels[[0, 1, 2]], 1);
    assert_eq!(slot.labels[[0, 1, 1]], 0);
    assert!(slot.acdc.contains(1));

    assert!(engine.erase(&EraserStroke::new(Point::new(2.0, 2.0), 1.0)).unwrap());
    let slot = engine.slot().unwrap();
    assert!(slot.labels.iter().all(|&v| v == 0));
    assert!(slot.acdc.is_empty());
}

#[test]
fn split_dumbbell_by_convexity_defect() {
    let dir = tempfile::tempdir().unwrap();
    let mut labels = Labels::zeros((1, 20, 20));
    square(&mut labels, 1, 9, 7, 3);
    square(&mut labels, 1, 9, 11, 3);
    labels[[0, 10, 10]] = 1;
    let mut engine = engine(dir.path(), vec![labels]);

    assert_eq!(engine.split_auto(1).unwrap(), vec![2]);
    let slot = engine.slot().unwrap();
    assert_eq!(slot.state.ids(), &[1, 2]);
    assert_eq!(slot.state.get(1).unwrap().area, 9);
    assert_eq!(slot.state.get(2).unwrap().area, 9);
    assert_eq!(slot.labels[[0, 10, 10]], 0);
}

#[test]
fn edit_id_swap_survives_retracking() {
    let dir = tempfile::tempdir().unwrap();
    let mut labels = Labels::zeros((1, 10, 10));
    square(&mut labels, 3, 1, 1, 3);
    square(&mut labels, 5, 6, 6, 3);
    let mut engine = engine(dir.path(), vec![labels.clone(), labels]);
    engine.set_mode(Mode::SegmentationTracking).unwrap();

    let (changed, _) = engine
        .edit_id(3, 5, false, Some(PropagationPolicy::ThisFrameOnly))
        .unwrap();
    assert!(changed);
    let slot = engine.slot().unwrap();
    assert_eq!(slot.labels[[0, 2, 2]], 5);
    assert_eq!(slot.labels[[0, 7, 7]], 3);
    assert_eq!(engine.position().manual_edit_log.len(), 2);

    engine.set_tracking(Some(true));
    engine.next_frame().unwrap();
    let slot = engine.slot().unwrap();
    assert_eq!(slot.labels[[0, 2, 2]], 5);
    assert_eq!(slot.labels[[0, 7, 7]], 3);
    assert!(!engine.repeat_tracking().unwrap());
}

#[test]
fn division_annotation_and_undo() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = Labels::zeros((1, 10, 10));
    square(&mut first, 10, 1, 1, 3);
    let mut later = first.clone();
    square(&mut later, 11, 6, 6, 2);
    let mut frames = vec![first];
    frames.extend(std::iter::repeat_n(later, 5));
    let mut engine = engine(dir.path(), frames);

    engine.set_mode(Mode::CellCycle).unwrap();
    engine.go_to_frame(5).unwrap();
    assert_eq!(engine.current_frame(), 5);
    let before = engine.slot().unwrap().acdc.clone();
    let bud = before.cca_row(11).unwrap();
    assert_eq!(bud.relationship, Relationship::Bud);
    assert_eq!(bud.relative_id, Some(10));
    assert_eq!(before.cca_row(10).unwrap().stage, CellCycleStage::S);

    engine.annotate_division(10).unwrap();
    let acdc = &engine.slot().unwrap().acdc;
    let (mother, bud) = (acdc.cca_row(10).unwrap(), acdc.cca_row(11).unwrap());
    assert_eq!((mother.stage, bud.stage), (CellCycleStage::G1, CellCycleStage::G1));
    assert_eq!((mother.generation_num, bud.generation_num), (3, 1));
    assert_eq!((mother.division_frame_i, bud.division_frame_i), (Some(5), Some(5)));

    assert!(engine.undo().unwrap());
    assert_eq!(engine.slot().unwrap().acdc, before);
}

#[test]
fn delete_roi_is_applied_to_saved_data() {
    let dir = tempfile::tempdir().unwrap();
    let mut labels = Labels::zeros((1, 10, 10));
    labels[[0, 2, 2]] = 2;
    labels[[0, 2, 7]] = 3;
    labels[[0, 8, 8]] = 4;
    let mut engine = engine(dir.path(), vec![labels; 8]);
    engine.set_mode(Mode::SegmentationTracking).unwrap();
    engine.go_to_frame(7).unwrap();

    let roi = engine
        .add_delete_roi(RoiShape::Rect {
            a: Point::new(0.0, 0.0),
            b: Point::new(8.0, 3.0),
        })
        .unwrap();
    assert_eq!(ids(&engine.exported_labels(7).unwrap()), vec![4]);
    // The labels themselves keep the objects.
    assert_eq!(engine.slot().unwrap().state.ids(), &[2, 3, 4]);

    assert!(
        engine
            .move_delete_roi(
                roi,
                RoiShape::Rect {
                    a: Point::new(0.0, 0.0),
                    b: Point::new(4.0, 3.0),
                },
            )
            .unwrap()
    );
    assert_eq!(ids(&engine.exported_labels(7).unwrap()), vec![3, 4]);

    let outcome = engine.save().unwrap();
    assert_eq!(outcome.frames_written, 8);
    let layout = PositionLayout::new(dir.path(), "pos", "");
    let saved = read_segmentation(&layout.segm_path(), false, 8).unwrap();
    assert_eq!(ids(&saved[7]), vec![3, 4]);
    assert_eq!(ids(&saved[6]), vec![2, 3, 4]);
    let tables = read_table(&layout.acdc_output_path(), &[]).unwrap();
    assert!(!tables[&7].contains(2));
    assert!(tables[&7].contains(3));
}

#[test]
fn relabel_keeps_cell_cycle_links() {
    let dir = tempfile::tempdir().unwrap();
    let mut labels = Labels::zeros((1, 12, 12));
    square(&mut labels, 2, 0, 0, 2);
    square(&mut labels, 5, 4, 4, 2);
    square(&mut labels, 9, 8, 8, 2);
    let meta = PositionMetadata::new_2d(1, 12, 12, "phase");
    let mut pos = Position::from_frames(meta, PositionLayout::new(dir.path(), "pos", ""), vec![labels]);
    {
        let acdc = &mut pos.ensure_slot(0).unwrap().acdc;
        acdc.init_cca();
        let mother = acdc.cca_row_mut(2).unwrap();
        mother.stage = CellCycleStage::S;
        mother.relative_id = Some(5);
        let bud = acdc.cca_row_mut(5).unwrap();
        bud.stage = CellCycleStage::S;
        bud.relative_id = Some(2);
        bud.relationship = Relationship::Bud;
        bud.generation_num = 0;
    }
    let mut engine = engine_for(pos);

    let mapping = engine.relabel().unwrap();
    assert_eq!(mapping.get(&9), Some(&3));
    let slot = engine.slot().unwrap();
    assert_eq!(slot.state.ids(), &[1, 2, 3]);
    let cca = slot.acdc.cca().unwrap();
    assert_eq!(cca[&1].relative_id, Some(2));
    assert_eq!(cca[&2].relative_id, Some(1));
    assert!(check_symmetry(cca).is_ok());

    // A second relabel changes nothing.
    let again = engine.relabel().unwrap();
    assert!(again.iter().all(|(old, new)| old == new));
}

#[test]
fn delete_absent_id_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let mut labels = Labels::zeros((1, 5, 5));
    square(&mut labels, 1, 1, 1, 2);
    let mut engine = engine(dir.path(), vec![labels]);
    let (changed, report) = engine.delete_ids(BTreeSet::from([42]), None).unwrap();
    assert!(!changed);
    assert!(report.is_empty());
    assert!(!engine.undo().unwrap());
}

#[test]
fn saved_position_reopens_unchanged() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("Position_1");
    let mut first = Labels::zeros((1, 12, 12));
    square(&mut first, 10, 1, 1, 3);
    square(&mut first, 5, 8, 8, 3);
    let mut later = first.clone();
    square(&mut later, 11, 1, 5, 2);
    let meta = PositionMetadata::new_2d(3, 12, 12, "phase");
    let layout = PositionLayout::new(&dir, "pos", "");
    meta.save(&layout.metadata_path()).unwrap();
    let pos = Position::from_frames(meta, layout, vec![first, later.clone(), later]);
    let mut engine = engine_for(pos);

    engine.set_mode(Mode::SegmentationTracking).unwrap();
    engine.set_tracking(Some(false));
    engine
        .set_excluded(BTreeSet::from([5]), true, Some(PropagationPolicy::ThisFrameOnly))
        .unwrap();
    let brushed = engine.brush(&BrushStroke::new(Point::new(9.0, 2.0), 1.0)).unwrap();
    assert_eq!(brushed, Some(12));

    engine.set_mode(Mode::CellCycle).unwrap();
    engine.go_to_frame(2).unwrap();
    let bud = engine.slot().unwrap().acdc.cca_row(11).unwrap().clone();
    assert_eq!(bud.relationship, Relationship::Bud);
    assert_eq!(bud.relative_id, Some(10));

    let before: Vec<(Labels, AcdcTable)> = (0..3)
        .map(|i| {
            let slot = engine.position().slot(i).unwrap();
            (slot.labels.clone(), slot.acdc.clone())
        })
        .collect();
    assert!(before.iter().all(|(_, acdc)| acdc.has_cca()));
    let saved_max = before.iter().map(|(labels, _)| acdc_labels::max_id(labels)).max().unwrap();

    assert_eq!(engine.save().unwrap().frames_written, 3);
    engine.close(false).unwrap();

    let mut reopened = Engine::open(&dir, None, config(), Box::new(AutoAccept)).unwrap();
    assert_eq!(reopened.position().size_t(), 3);
    assert!(!reopened.position().recovery_available());
    assert!(reopened.position().brush_id() > saved_max);
    for (i, (labels, acdc)) in before.iter().enumerate() {
        reopened.go_to_frame(i).unwrap();
        let slot = reopened.slot().unwrap();
        assert_eq!(&slot.labels, labels, "labels of frame {}", i);
        assert_eq!(&slot.acdc, acdc, "annotations of frame {}", i);
    }
    reopened.go_to_frame(0).unwrap();
    let row = reopened.slot().unwrap().acdc.row(5).unwrap().clone();
    assert!(row.is_cell_excluded);
}
