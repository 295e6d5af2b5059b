//! End-to-end classification through the reference device

use std::fs;
use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};

use dlaclassify::engine::{labels::load_labels, AcceleratorBackend, ReferenceBackend};
use dlaclassify::utils::image::{expand_inputs, ChannelOrder, FileDecoder};
use dlaclassify::{ClassificationPipeline, PipelineError};

fn solid_png(dir: &Path, name: &str, value: u8) -> PathBuf {
    let path = dir.join(name);
    RgbImage::from_pixel(4, 4, Rgb([value, value, value]))
        .save(&path)
        .unwrap();
    path
}

fn labels() -> Vec<String> {
    ["zero", "one", "two", "three", "four"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[test]
fn test_unreadable_image_skipped_and_rows_attributed_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let a = solid_png(dir.path(), "a.png", 1);
    let b = solid_png(dir.path(), "b.png", 2);
    let c = solid_png(dir.path(), "c.png", 3);
    let broken = dir.path().join("broken.png");
    fs::write(&broken, b"definitely not a png").unwrap();

    let backend = ReferenceBackend::new().with_input(3, 4, 4).with_classes(5);
    let model = backend.read_model(Path::new("reference.xml")).unwrap();
    let pipeline = ClassificationPipeline::new(FileDecoder::new(ChannelOrder::Bgr), 3, labels());

    let results = pipeline
        .run(&[a.clone(), broken, b.clone(), c.clone()], model.as_ref(), 2)
        .unwrap();

    assert_eq!(results.len(), 3);
    let expected = [(a, 1, "one"), (b, 2, "two"), (c, 3, "three")];
    for (result, (path, class_id, label)) in results.iter().zip(expected) {
        assert_eq!(result.image, path);
        assert_eq!(result.ranked.classes.len(), 2);

        let top = result.ranked.top().unwrap();
        assert_eq!(top.class_id, class_id);
        assert_eq!(top.label, label);
        assert!((top.score - 1.0).abs() < 1e-6);

        // all other classes score zero; ties go to the lowest class id
        assert_eq!(result.ranked.classes[1].class_id, 0);
        assert_eq!(result.ranked.classes[1].label, "zero");
    }
}

#[test]
fn test_directory_input_and_label_file() {
    let dir = tempfile::tempdir().unwrap();
    solid_png(dir.path(), "02.png", 4);
    solid_png(dir.path(), "01.png", 2);
    fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

    let label_file = dir.path().join("model.labels");
    fs::write(&label_file, "zero\none\ntwo\n").unwrap();
    let labels = load_labels(&label_file).unwrap();

    let inputs = expand_inputs(&[dir.path().to_path_buf()]).unwrap();
    assert_eq!(
        inputs,
        vec![dir.path().join("01.png"), dir.path().join("02.png")]
    );

    let model = ReferenceBackend::new()
        .with_input(3, 4, 4)
        .with_classes(5)
        .read_model(Path::new("reference.xml"))
        .unwrap();
    let pipeline = ClassificationPipeline::new(FileDecoder::new(ChannelOrder::Rgb), 1, labels);
    let results = pipeline.run(&inputs, model.as_ref(), 1).unwrap();

    let tops: Vec<(usize, String)> = results
        .iter()
        .map(|r| {
            let top = r.ranked.top().unwrap();
            (top.class_id, top.label.clone())
        })
        .collect();
    assert_eq!(tops, vec![(2, "two".to_string()), (4, "#4".to_string())]);
}

#[test]
fn test_all_inputs_unreadable() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.png");
    let broken = dir.path().join("broken.png");
    fs::write(&broken, b"garbage").unwrap();

    let model = ReferenceBackend::new()
        .with_input(3, 4, 4)
        .read_model(Path::new("reference.xml"))
        .unwrap();
    let pipeline = ClassificationPipeline::new(FileDecoder::default(), 2, labels());

    let err = pipeline
        .run(&[missing, broken], model.as_ref(), 1)
        .unwrap_err();
    assert!(matches!(err, PipelineError::Input(_)));
}
