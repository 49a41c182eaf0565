use std::sync::Arc;

use ffmpeg_bus::picture::{Picture, PictureRef};

use super::SyncBuffer;

fn picture(pts: i64) -> PictureRef {
    let mut p = Picture::new(4, 4);
    p.set_timestamps(pts, pts);
    Arc::new(p)
}

fn pts(p: Option<PictureRef>) -> Option<i64> {
    p.map(|p| p.pts())
}

#[test]
fn test_overflow_keeps_occupancy_within_capacity() {
    let buffer = SyncBuffer::new("cam0", 4, 100);
    for ts in 0..10 {
        buffer.push(picture(ts * 10));
        assert!(buffer.occupancy() <= buffer.capacity());
    }
    // pushes 0..4 filled it, the fifth push dropped them, the ninth did it again
    assert_eq!(buffer.occupancy(), 2);
    assert_eq!(pts(buffer.pull(10)), Some(90));
}

#[test]
fn test_survivors_are_most_recent() {
    let buffer = SyncBuffer::new("cam0", 3, 100);
    buffer.push(picture(0));
    assert_eq!(pts(buffer.pull(10)), Some(0));

    for ts in [10, 20, 30, 40, 50, 60] {
        buffer.push(picture(ts));
    }
    assert_eq!(buffer.occupancy(), 3);
    assert_eq!(pts(buffer.pull(10)), Some(40));
    assert_eq!(pts(buffer.pull(10)), Some(50));
    assert_eq!(pts(buffer.pull(10)), Some(60));
}

#[test]
fn test_first_pull_serves_newest() {
    let buffer = SyncBuffer::new("cam0", 8, 100);
    for ts in [10, 20, 30] {
        buffer.push(picture(ts));
    }
    assert_eq!(pts(buffer.pull(10)), Some(30));
    assert_eq!(buffer.occupancy(), 0);
}

#[test]
fn test_catch_up_skips_overdue_pictures() {
    let buffer = SyncBuffer::new("cam0", 60, 100);
    buffer.push(picture(100));
    assert_eq!(pts(buffer.pull(100)), Some(100));

    buffer.push(picture(140));
    buffer.push(picture(220));
    let served = pts(buffer.pull(100)).unwrap();
    assert!(served >= 140);
    assert_eq!(served, 220);
    assert_eq!(buffer.occupancy(), 0);
}

#[test]
fn test_stops_at_first_picture_not_yet_due() {
    let buffer = SyncBuffer::new("cam0", 60, 100);
    buffer.push(picture(0));
    assert_eq!(pts(buffer.pull(40)), Some(0));

    for ts in [20, 40, 60, 80] {
        buffer.push(picture(ts));
    }
    // 20 < 40 is overdue, 40 is due
    assert_eq!(pts(buffer.pull(40)), Some(40));
    assert_eq!(buffer.occupancy(), 2);
    // 60 < 80 is overdue, 80 is the last one
    assert_eq!(pts(buffer.pull(40)), Some(80));
}

#[test]
fn test_never_goes_back_in_time() {
    let buffer = SyncBuffer::new("cam0", 60, 100);
    buffer.push(picture(500));
    assert_eq!(pts(buffer.pull(40)), Some(500));
    buffer.push(picture(300));
    // older picture arrives: the last one is repeated instead
    assert_eq!(pts(buffer.pull(40)), Some(500));
}

#[test]
fn test_empty_buffer_returns_nothing() {
    let buffer = SyncBuffer::new("cam0", 60, 100);
    assert!(buffer.pull(40).is_none());
}

#[test]
fn test_stall_after_repeat_limit() {
    let buffer = SyncBuffer::new("cam0", 60, 100);
    buffer.push(picture(7));
    assert_eq!(pts(buffer.pull(40)), Some(7));
    for _ in 0..100 {
        assert_eq!(pts(buffer.pull(40)), Some(7));
    }
    // 101st repeat
    assert!(buffer.pull(40).is_none());
    assert!(buffer.pull(40).is_none());

    // fresh data heals the cell
    buffer.push(picture(8));
    assert_eq!(pts(buffer.pull(40)), Some(8));
}

#[test]
fn test_stall_does_not_rewind() {
    let buffer = SyncBuffer::new("cam0", 60, 2);
    buffer.push(picture(500));
    assert_eq!(pts(buffer.pull(40)), Some(500));
    buffer.pull(40);
    buffer.pull(40);
    assert!(buffer.pull(40).is_none());

    buffer.push(picture(300));
    assert!(buffer.pull(40).is_none());
    buffer.push(picture(540));
    assert_eq!(pts(buffer.pull(40)), Some(540));
}

#[test]
fn test_reset_clears_backlog_and_watermark() {
    let buffer = SyncBuffer::new("cam0", 60, 100);
    buffer.push(picture(90_000));
    assert_eq!(pts(buffer.pull(40)), Some(90_000));
    buffer.push(picture(90_040));
    buffer.reset();
    assert_eq!(buffer.occupancy(), 0);
    assert!(buffer.pull(40).is_none());

    // restarted source timestamps are accepted
    buffer.push(picture(0));
    assert_eq!(pts(buffer.pull(40)), Some(0));
}

#[test]
fn test_push_and_pull_from_two_threads() {
    let buffer = Arc::new(SyncBuffer::new("cam0", 8, 1000));
    let producer = {
        let buffer = Arc::clone(&buffer);
        std::thread::spawn(move || {
            for ts in 0..500 {
                buffer.push(picture(ts));
            }
        })
    };
    let mut last = i64::MIN;
    for _ in 0..500 {
        if let Some(p) = buffer.pull(1) {
            assert!(p.pts() >= last);
            last = p.pts();
        }
    }
    producer.join().unwrap();
    assert!(buffer.occupancy() <= 8);
}
