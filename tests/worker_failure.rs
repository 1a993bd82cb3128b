mod common;

use std::net::TcpStream;

use distcarve::protocol::{ControlMessage, recv_control, send_control};
use distcarve::worker::WorkerAgent;

use common::{Cluster, MIB, agent_settings, artifact, build_image};

/// Connects, takes one task and disappears without reporting.
fn crash_after_taking_task(addr: &str) -> u64 {
    let mut stream = TcpStream::connect(addr).expect("connect");
    send_control(
        &mut stream,
        &ControlMessage::Hello {
            worker_id: "flaky".to_string(),
            hostname: None,
            status: Some("ready".to_string()),
        },
    )
    .expect("hello");
    send_control(&mut stream, &ControlMessage::RequestTask).expect("request");
    let task = recv_control(&mut stream)
        .expect("recv")
        .expect("task message")
        .to_task()
        .expect("task");
    drop(stream);
    task.id
}

#[test]
fn crashed_worker_loses_its_task_and_others_finish() {
    let planted: Vec<(u64, Vec<u8>)> = (0..4u64)
        .map(|i| (i * MIB + 1_000, artifact(3_000, i as u8)))
        .collect();
    let image = build_image(4 * MIB as usize, &planted);
    let cluster = Cluster::new(&image, MIB, 64 * 1024);

    let master = cluster.bind();
    let addr = master.local_addr().expect("addr").to_string();
    let scratch = cluster.scratch_dir();

    let client = std::thread::spawn(move || {
        let lost = crash_after_taking_task(&addr);
        let report = WorkerAgent::new(agent_settings(&addr, "steady", &scratch))
            .connect_and_run()
            .expect("steady worker");
        (lost, report)
    });

    let summary = master.run().expect("master run");
    let (lost, report) = client.join().expect("client thread");

    assert_eq!(lost, 0);
    assert_eq!(summary.lost_tasks, vec![0]);
    assert_eq!(summary.sessions_failed, 1);
    assert_eq!(summary.workers_connected, 2);
    assert_eq!(summary.tasks_completed, 3);
    assert_eq!(summary.tasks_unserved, 0);
    assert_eq!(report.tasks_completed, 3);

    let recovered = cluster.recovered();
    assert_eq!(recovered.len(), 3);
    assert!(!recovered.contains_key(&1_000));

    let sessions = std::fs::read_to_string(cluster.run_dir().join("metadata").join("sessions.jsonl"))
        .expect("sessions");
    assert!(sessions.contains("\"lost_task\":0"));
}
