use cell_detector::image::io::{save_grayscale_f32, write_json_file};
use cell_detector::model::reference::ReferenceModel;
use cell_detector::{load_ops, select_rois_with_report, DetectOps, Movie, ProjectionMode};
use std::path::Path;

fn main() {
    // Demo stub: builds a synthetic movie with one flickering cell and runs
    // the detector against the reference backend. An optional argument
    // points at a JSON config overriding the defaults.
    let (nframes, ly, lx) = (60usize, 64usize, 64usize);
    let (cy, cx, sigma) = (30.0f32, 34.0f32, 3.0f32);
    let mut mov = Movie::new(nframes, ly, lx);
    for t in 0..nframes {
        let gain = 1.0 + 0.8 * (t as f32 * 0.4).sin();
        let frame = mov.frame_mut(t);
        for y in 0..ly {
            for x in 0..lx {
                let dy = y as f32 - cy;
                let dx = x as f32 - cx;
                let blob = (-(dy * dy + dx * dx) / (2.0 * sigma * sigma)).exp();
                frame[y * lx + x] = 10.0 * gain * blob;
            }
        }
    }

    let model = ReferenceModel::default();
    let mut ops = match std::env::args().nth(1) {
        Some(path) => match load_ops(Path::new(&path)) {
            Ok(ops) => ops,
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
        },
        None => DetectOps {
            anatomical_only: ProjectionMode::RatioMax,
            ..Default::default()
        },
    };
    let report = match select_rois_with_report(&model, &mut ops, &mut mov) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("detection failed: {e}");
            std::process::exit(1);
        }
    };
    println!(
        "rois={} median_diameter={:?} latency_ms={:.3}",
        report.stats.len(),
        ops.diameter_estimate,
        report.summary.timings.total_ms
    );

    let out_dir = Path::new("demo_out");
    if let Some(max_proj) = &ops.max_proj {
        if let Err(e) = save_grayscale_f32(max_proj, &out_dir.join("max_proj.png")) {
            eprintln!("{e}");
        }
    }
    if let Err(e) = write_json_file(&out_dir.join("summary.json"), &report.summary) {
        eprintln!("{e}");
    }
}
