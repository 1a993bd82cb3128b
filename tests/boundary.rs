mod common;

use common::{Cluster, MIB, artifact, build_image, insert_bytes, recovered_records};

const BOUNDARY: u64 = MIB;

fn straddling_image() -> (Vec<u8>, u64, Vec<u8>) {
    let offset = BOUNDARY - 5_000;
    let blob = artifact(30_000, 3);
    let image = build_image(4 * MIB as usize, &[(offset, blob.clone())]);
    (image, offset, blob)
}

#[test]
fn straddling_artifact_is_recovered_once_by_owner() {
    let (image, offset, blob) = straddling_image();
    let cluster = Cluster::new(&image, MIB, 100_000);

    let outcome = cluster.run(2);

    assert_eq!(outcome.summary.files_persisted, 1);
    assert_eq!(outcome.summary.duplicates, 0);
    // The neighbour sees the same span in its overlap but does not own it.
    assert_eq!(outcome.summary.artifacts_reported, 1);

    let recovered = cluster.recovered();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered.get(&offset), Some(&blob));

    // Task 0 owns [0, 1 MiB), where the artifact starts.
    let records = recovered_records(cluster.run_dir());
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["offset"], offset);
    assert_eq!(records[0]["task_id"], 0);
}

#[test]
fn straddling_artifact_is_missed_without_overlap() {
    let (image, _offset, _blob) = straddling_image();
    let cluster = Cluster::new(&image, MIB, 0);

    let outcome = cluster.run(1);

    assert_eq!(outcome.summary.tasks_completed, 4);
    assert_eq!(outcome.summary.files_persisted, 0);
    assert!(cluster.recovered().is_empty());
}

#[test]
fn artifact_owned_by_right_hand_task() {
    let offset = BOUNDARY + 10;
    let blob = artifact(20_000, 9);
    let image = build_image(2 * MIB as usize, &[(offset, blob.clone())]);
    let cluster = Cluster::new(&image, MIB, 200_000);

    let outcome = cluster.run(1);
    assert_eq!(outcome.summary.files_persisted, 1);
    assert_eq!(outcome.summary.artifacts_reported, 1);
    assert_eq!(cluster.recovered().get(&offset), Some(&blob));
}

#[test]
fn stray_header_before_boundary_does_not_hide_owned_artifact() {
    let offset = BOUNDARY + 100;
    let blob = artifact(100_000, 4);
    let mut image = build_image(4 * MIB as usize, &[(offset, blob.clone())]);
    insert_bytes(&mut image, (BOUNDARY - 1_000) as usize, &[0xFF, 0xD8]);
    let cluster = Cluster::new(&image, MIB, 128 * 1024);

    let outcome = cluster.run(1);

    assert_eq!(outcome.summary.files_persisted, 1);
    assert_eq!(outcome.summary.artifacts_reported, 1);
    assert_eq!(cluster.recovered().get(&offset), Some(&blob));
    let records = recovered_records(cluster.run_dir());
    assert_eq!(records[0]["task_id"], 1);
}
