#![allow(missing_docs)]

use std::fs;
use std::time::Duration;

use nimbus::statelog::{read_frames, ChecksummedWriter, OpenFiles};
use tempfile::tempdir;

#[test]
fn a_thousand_payloads_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("shared-state.log");

    let payloads: Vec<Vec<u8>> = (0..1000u32)
        .map(|k| format!("payload number {k} with distinct content").into_bytes())
        .collect();

    {
        let files = OpenFiles::new(8);
        for payload in &payloads {
            files.append(&path, payload).unwrap();
        }
        files.flush(&path).unwrap();
        files.shutdown();
        // writer dropped without any further cleanup, as in a crash after
        // the flush hit the kernel
    }

    let outcome = read_frames(&path).unwrap();
    assert!(!outcome.truncated);
    assert_eq!(outcome.frames.len(), 1000);
    for (frame, expected) in outcome.frames.iter().zip(&payloads) {
        assert_eq!(frame, expected);
    }
}

#[test]
fn corrupting_one_frame_truncates_the_read_there() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("corrupted.log");

    let payloads: Vec<Vec<u8>> = (0..1000u32)
        .map(|k| format!("payload number {k}").into_bytes())
        .collect();

    {
        let mut writer = ChecksummedWriter::open(&path).unwrap();
        for payload in &payloads {
            writer.append(payload).unwrap();
        }
        writer.flush().unwrap();
    }

    // find the byte offset of the 500th frame and damage its payload
    let mut offset = 0usize;
    for payload in payloads.iter().take(499) {
        offset += 12 + payload.len();
    }
    let mut bytes = fs::read(&path).unwrap();
    bytes[offset + 4] ^= 0x01; // inside the length/payload region
    fs::write(&path, &bytes).unwrap();

    let outcome = read_frames(&path).unwrap();
    assert!(outcome.truncated);
    assert_eq!(outcome.frames.len(), 499);
    for (frame, expected) in outcome.frames.iter().zip(&payloads) {
        assert_eq!(frame, expected);
    }
}

#[test]
fn interleaved_files_keep_their_own_streams() {
    let dir = tempdir().unwrap();
    let files = OpenFiles::new(2);

    let paths: Vec<_> = (0..5)
        .map(|k| dir.path().join(format!("stream-{k}.log")))
        .collect();

    for round in 0..50u32 {
        for (stream, path) in paths.iter().enumerate() {
            files
                .append(path, format!("s{stream}-r{round}").as_bytes())
                .unwrap();
        }
    }
    files.shutdown();

    for (stream, path) in paths.iter().enumerate() {
        let outcome = read_frames(path).unwrap();
        assert!(!outcome.truncated);
        assert_eq!(outcome.frames.len(), 50);
        for (round, frame) in outcome.frames.iter().enumerate() {
            assert_eq!(frame, format!("s{stream}-r{round}").as_bytes());
        }
    }
}

#[test]
fn background_flush_makes_appends_durable_without_explicit_flush() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("auto-flush.log");
    let files = OpenFiles::with_flush_interval(4, Duration::from_millis(25));

    files.append(&path, b"auto-flushed payload").unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let frames = read_frames(&path).map(|o| o.frames.len()).unwrap_or(0);
        if frames == 1 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "background flusher never flushed"
        );
        std::thread::sleep(Duration::from_millis(10));
    }

    files.shutdown();
}

#[test]
fn shutdown_flushes_and_closes_everything() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("shutdown.log");
    let files = OpenFiles::new(4);

    files.append(&path, b"must survive shutdown").unwrap();
    files.shutdown();
    assert_eq!(files.open_count(), 0);

    let outcome = read_frames(&path).unwrap();
    assert_eq!(outcome.frames, vec![b"must survive shutdown".to_vec()]);
}
