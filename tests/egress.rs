use labsensor::io::{read_frames, run_egress, verify_chain, EgressTargets, SessionHeader};
use labsensor::replay::{parse_events, ReplayHost};
use labsensor::{Emitted, Sensor, SensorConfig};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const STIMULUS: &str = r#"
{"type":"process_create","pid":77,"create_time":3,"parent_pid":1,"image":"C:\\lab\\sample.exe"}
{"type":"file_create","pid":77,"create_time":3,"path":"C:\\Users\\lab\\Downloads\\drop.ps1"}
{"type":"dns_query","pid":77,"create_time":3,"query_name":"example.net"}
{"type":"process_exit","pid":77,"create_time":3,"exit_code":0}
"#;

#[tokio::test]
async fn sensor_output_lands_in_a_verifiable_log_and_frames() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("events.jsonl");
    let frames = dir.path().join("events.bin");

    let host = Arc::new(ReplayHost::new(parse_events(STIMULUS).unwrap()));
    let (tx, rx) = mpsc::channel::<Emitted>(64);
    let egress = tokio::spawn(run_egress(
        rx,
        EgressTargets {
            log: log.clone(),
            frames: Some(frames.clone()),
        },
        SessionHeader::new(),
    ));

    let sensor = Sensor::attach(&SensorConfig::default(), host.clone(), tx).await.unwrap();
    host.wait_until_finished().await;
    sensor.detach(Duration::from_secs(5)).await.unwrap();
    let summary = egress.await.unwrap().unwrap();

    assert_eq!(summary.events, 4);
    assert_eq!(summary.frames, 4);
    // header + events + final stats
    assert_eq!(verify_chain(&log).unwrap(), 1 + 4 + summary.stats);

    let text = fs::read_to_string(&log).unwrap();
    let header: serde_json::Value =
        serde_json::from_str(text.lines().next().unwrap().split_once(' ').unwrap().1).unwrap();
    assert_eq!(header["stream"], "sensor_events");
    assert!(header["hostname"].as_str().is_some_and(|h| !h.is_empty()));

    let dropped: Vec<serde_json::Value> = text
        .lines()
        .skip(1)
        .map(|l| serde_json::from_str(l.split_once(' ').unwrap().1).unwrap())
        .filter(|v: &serde_json::Value| v["type"] == "event")
        .collect();
    assert_eq!(dropped[1]["payload"]["kind"], "FILE_CREATE");
    assert_eq!(dropped[1]["tags"][0], "DOWNLOAD_DROP");
    assert!(dropped[0]["observed_at"].as_str().is_some());

    let readout = read_frames(fs::File::open(&frames).unwrap()).unwrap();
    assert_eq!(readout.errors, 0);
    let seqs: Vec<u64> = readout.records.iter().map(|r| r.sequence).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);
}
