use cell_detector::model::reference::ReferenceModel;
use cell_detector::model::{EvalOutput, EvalParams, ModelError, SegmentationModel};
use cell_detector::{patch_detect, refine_masks, DetectError, ImageF32, Stat};

const FRAME: usize = 10;
const HALF: usize = 10; // patch side 2 * HALF, window covers the whole frame

/// Patch with a bright block in window coordinates.
fn block_patch(rows: (usize, usize), cols: (usize, usize)) -> ImageF32 {
    let mut patch = ImageF32::new(2 * HALF, 2 * HALF);
    for y in rows.0..rows.1 {
        for x in cols.0..cols.1 {
            patch.set(x, y, 1.0);
        }
    }
    patch
}

/// 3x3 footprint at frame rows/cols 4..7 with the given weights.
fn footprint_stat(weights: [f32; 9]) -> Stat {
    let mut ypix = Vec::new();
    let mut xpix = Vec::new();
    for y in 4..7 {
        for x in 4..7 {
            ypix.push(y);
            xpix.push(x);
        }
    }
    Stat {
        ypix,
        xpix,
        lam: weights.to_vec(),
        med: [5, 5],
        footprint: 1.0,
        anatomical: false,
    }
}

#[test]
fn adopted_footprints_keep_only_positive_weights() {
    let _ = env_logger::builder().is_test(true).try_init();
    let model = ReferenceModel::default();
    // Footprint weights include a negative entry; min positive is 0.5.
    let mut stats = vec![footprint_stat([1.0, -1.0, 2.0, 0.5, 1.5, 1.0, 2.0, 1.0, 0.5])];
    // Anatomical mask: 4x4 block covering frame rows/cols 4..8
    // (window coordinates are frame + HALF - seed = frame + 5).
    let patches = vec![block_patch((9, 13), (9, 13))];
    refine_masks(&model, &mut stats, &patches, &[[5, 5]], 30.0, FRAME, FRAME).expect("refine");

    let stat = &stats[0];
    assert!(stat.anatomical, "footprint should have been adopted");
    assert_eq!(stat.npix(), 16);
    assert!(stat.lam.iter().all(|&l| l > 0.0), "lam={:?}", stat.lam);
    let min = stat.lam.iter().copied().fold(f32::INFINITY, f32::min);
    assert_eq!(min, 0.5, "replacement must be the minimum positive weight");
    // The pixel that held the negative weight now carries that minimum.
    let neg_idx = stat
        .ypix
        .iter()
        .zip(&stat.xpix)
        .position(|(&y, &x)| y == 4 && x == 5)
        .expect("pixel present");
    assert_eq!(stat.lam[neg_idx], 0.5);
    // Every recovered coordinate lies inside the frame.
    assert!(stat.ypix.iter().all(|&y| y < FRAME));
    assert!(stat.xpix.iter().all(|&x| x < FRAME));
}

#[test]
fn iou_exactly_at_threshold_leaves_the_footprint_unrefined() {
    let _ = env_logger::builder().is_test(true).try_init();
    let model = ReferenceModel::default();
    let original = footprint_stat([1.0; 9]);
    let mut stats = vec![original.clone()];
    // 4x5 anatomical block (20 px) fully containing the 3x3 footprint:
    // IOU = 9 / 20 = 0.45, which must NOT pass the strict threshold.
    let patches = vec![block_patch((9, 13), (9, 14))];
    refine_masks(&model, &mut stats, &patches, &[[5, 5]], 30.0, FRAME, FRAME).expect("refine");

    let stat = &stats[0];
    assert!(!stat.anatomical);
    assert_eq!(stat.ypix, original.ypix);
    assert_eq!(stat.xpix, original.xpix);
    assert_eq!(stat.lam, original.lam);
}

#[test]
fn empty_patch_masks_leave_the_footprint_untouched() {
    let _ = env_logger::builder().is_test(true).try_init();
    let model = ReferenceModel::default();
    let original = footprint_stat([1.0; 9]);
    let mut stats = vec![original.clone()];
    let patches = vec![ImageF32::new(2 * HALF, 2 * HALF)];
    refine_masks(&model, &mut stats, &patches, &[[5, 5]], 30.0, FRAME, FRAME).expect("refine");
    assert!(!stats[0].anatomical);
    assert_eq!(stats[0].ypix, original.ypix);
}

#[test]
fn patch_batches_must_agree_in_size() {
    let model = ReferenceModel::default();
    let err = patch_detect(&model, &[], 12.0).unwrap_err();
    assert!(matches!(err, DetectError::BadPatches));

    let mismatched = vec![ImageF32::new(16, 16), ImageF32::new(20, 20)];
    let err = patch_detect(&model, &mismatched, 12.0).unwrap_err();
    assert!(matches!(err, DetectError::BadPatches));
}

struct EvalOnlyModel;

impl SegmentationModel for EvalOnlyModel {
    fn eval(&self, _: &ImageF32, _: &EvalParams) -> Result<EvalOutput, ModelError> {
        Err(ModelError::Backend("eval unused in this test".into()))
    }
}

#[test]
fn missing_network_entry_points_are_fatal() {
    let _ = env_logger::builder().is_test(true).try_init();
    let patches = vec![block_patch((9, 13), (9, 13))];
    let err = patch_detect(&EvalOnlyModel, &patches, 30.0).unwrap_err();
    match err {
        DetectError::Model(ModelError::MissingEntryPoint) => {}
        other => panic!("unexpected error: {other}"),
    }
}
