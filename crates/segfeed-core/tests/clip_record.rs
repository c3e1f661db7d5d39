use segfeed_core::types::{ClipRecord, ClipRecordError};

#[test]
fn clip_record_requires_path() {
    let r = ClipRecord {
        path: "   ".to_string(),
        duration_frames: 120,
        label: 3,
    };
    assert_eq!(r.validate(), Err(ClipRecordError::EmptyPath));
}

#[test]
fn clip_record_requires_nonzero_duration() {
    let r = ClipRecord {
        path: "videos/archery/clip01.mp4".to_string(),
        duration_frames: 0,
        label: 3,
    };
    assert_eq!(r.validate(), Err(ClipRecordError::ZeroDuration));
}

#[test]
fn clip_record_accepts_single_frame_clip() {
    let r = ClipRecord {
        path: "videos/archery/clip01.mp4".to_string(),
        duration_frames: 1,
        label: 0,
    };
    assert_eq!(r.validate(), Ok(()));
}

#[test]
fn clip_record_accepts_typical_entry() {
    let r = ClipRecord {
        path: "videos/diving/clip07.mp4".to_string(),
        duration_frames: 300,
        label: 17,
    };
    assert_eq!(r.validate(), Ok(()));
}
