use std::{fs, path::PathBuf};

use ndarray::{Array2, Array4, IxDyn};
use results::{Level, Node, ResultErr, ResultSet, ResultTree, load_f32_tensors, save_selection};

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir()
        .join(format!("results-store-{}", std::process::id()))
        .join(name)
}

fn filled_set() -> ResultSet {
    let mut tree = ResultTree::new(vec![
        Level::new("masker", ["B", "A"]).unwrap(),
        Level::new("method", ["m1"]).unwrap(),
        Level::new("activation_fn", ["linear"]).unwrap(),
    ])
    .unwrap();

    // Two batches arriving out of order.
    for range in [5..10, 0..5] {
        let indices: Vec<usize> = range.collect();
        let mut payload = Node::branch();
        for masker in ["A", "B"] {
            let offset = if masker == "A" { 0.0 } else { 1000.0 };
            let values = Array2::from_shape_fn((indices.len(), 5), |(i, j)| {
                offset + (indices[i] * 5 + j) as f32
            });
            payload
                .insert(&[masker, "m1", "linear"], values.into_dyn())
                .unwrap();
        }
        tree.append(&indices, &payload, &[]).unwrap();
    }

    let mut set = ResultSet::new(10);
    set.insert_group("deletion", tree).unwrap();
    set.set_attr("task", "deletion");
    set.finalize().unwrap();
    set
}

#[test]
fn save_and_load_round_trip() {
    let set = filled_set();
    let path = temp_path("round_trip.safetensors");
    set.save(&path).unwrap();

    let loaded = ResultSet::load(&path).unwrap();
    assert_eq!(loaded.num_samples(), 10);
    assert_eq!(loaded.attr("task"), Some("deletion"));

    let tree = loaded.group("deletion").unwrap();
    let names: Vec<&str> = tree.levels().iter().map(|l| l.name()).collect();
    assert_eq!(names, ["masker", "method", "activation_fn"]);
    assert_eq!(tree.levels()[0].keys(), ["A".to_string(), "B".to_string()]);

    for masker in ["A", "B"] {
        let original = set.group("deletion").unwrap().get(&[masker, "m1", "linear"]).unwrap();
        let restored = tree.get(&[masker, "m1", "linear"]).unwrap();
        assert_eq!(restored.shape(), &[10, 5]);
        assert_eq!(restored, original);
    }

    let a = tree.get(&["A", "m1", "linear"]).unwrap();
    assert_eq!(a[IxDyn(&[7, 2])], 37.0);

    fs::remove_file(&path).unwrap();
}

#[test]
fn truncated_leaf_is_rejected() {
    let set = filled_set();
    let mut bytes = set.to_bytes().unwrap();

    // Corrupt the sample count so no leaf has the advertised row count.
    let needle = b"\"num_samples\":\"10\"";
    let at = bytes
        .windows(needle.len())
        .position(|w| w == needle)
        .unwrap();
    bytes[at + needle.len() - 3] = b'2';

    assert!(matches!(
        ResultSet::from_bytes(&bytes),
        Err(ResultErr::InvalidResultFile(_))
    ));
}

#[test]
fn unfinalized_sets_are_not_written() {
    let tree = ResultTree::new(vec![Level::new("method", ["m1"]).unwrap()]).unwrap();
    let mut set = ResultSet::new(3);
    set.insert_group("insertion", tree).unwrap();

    assert!(matches!(set.to_bytes(), Err(ResultErr::Coverage(_))));
    assert!(matches!(set.finalize(), Err(ResultErr::Coverage(_))));
}

#[test]
fn selection_keeps_samples_and_bookkeeping() {
    let path = temp_path("selection.safetensors");
    let samples = Array4::from_shape_fn((2, 1, 2, 2), |(n, _, h, w)| (n * 4 + h * 2 + w) as f32);
    save_selection(&path, samples.view(), &[3, 1], &[8, 2]).unwrap();

    let tensors = load_f32_tensors(&path).unwrap();
    assert_eq!(tensors.len(), 1);
    assert_eq!(tensors[0].0, "samples");
    assert_eq!(tensors[0].1, samples.into_dyn());

    fs::remove_file(&path).unwrap();
}
