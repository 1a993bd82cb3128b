//! The persisted set does not depend on the order tasks are processed in.

mod common;

use std::collections::BTreeSet;
use std::io::Cursor;

use distcarve::aggregate::{Admission, Aggregator, Origin};
use distcarve::carve::{CarveEngine, CarveSettings, CarveWindow};
use distcarve::evidence::{RawFileSource, read_range};
use distcarve::task::{Task, TaskQueue, build_tasks};

use common::{MIB, artifact, build_image};

fn carve_in_order(image_path: &std::path::Path, tasks: &[Task], out: &std::path::Path) -> BTreeSet<(u64, String)> {
    let source = RawFileSource::open(image_path).expect("open image");
    let engine = CarveEngine::new(CarveSettings {
        scan_block_size: 256 * 1024,
        tail_keep: 128 * 1024,
        ..CarveSettings::default()
    });
    let aggregator = Aggregator::new(&out.join("recovered"), "jpg").expect("aggregator");

    let queue = TaskQueue::from_tasks(tasks.iter().copied());
    while let Some(task) = queue.pop() {
        let chunk = read_range(&source, task.read_start, task.read_end).expect("read chunk");
        let scratch = out.join(format!("scratch_{}", task.id));
        let outcome = engine
            .carve_reader(Cursor::new(chunk), &CarveWindow::from(&task), &scratch)
            .expect("carve");
        for found in outcome.artifacts {
            let bytes = std::fs::read(&found.path).expect("read scratch");
            let admission = aggregator
                .receive_artifact(&bytes, found.offset, Origin::new("local", task.id))
                .expect("aggregate");
            assert!(matches!(admission, Admission::Persisted(_)));
        }
    }

    aggregator
        .records()
        .into_iter()
        .map(|r| (r.offset, r.hash))
        .collect()
}

#[test]
fn forward_and_reverse_orders_agree() {
    let len = 6 * MIB;
    let planted: Vec<(u64, Vec<u8>)> = (0..12u64)
        .map(|i| (i * (len / 12) + 777, artifact(2_000 + i as usize * 500, i as u8)))
        .collect();
    let image = build_image(len as usize, &planted);

    let dir = tempfile::tempdir().expect("tempdir");
    let image_path = dir.path().join("image.dd");
    std::fs::write(&image_path, &image).expect("write image");

    let tasks = build_tasks(len, MIB / 2, 32 * 1024);
    let mut reversed = tasks.clone();
    reversed.reverse();
    let mut interleaved: Vec<Task> = tasks.iter().step_by(2).copied().collect();
    interleaved.extend(tasks.iter().skip(1).step_by(2).copied());

    let forward = carve_in_order(&image_path, &tasks, &dir.path().join("fwd"));
    let backward = carve_in_order(&image_path, &reversed, &dir.path().join("rev"));
    let mixed = carve_in_order(&image_path, &interleaved, &dir.path().join("mix"));

    assert_eq!(forward.len(), 12);
    assert_eq!(forward, backward);
    assert_eq!(forward, mixed);
}
