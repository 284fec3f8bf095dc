use std::sync::Arc;

use chapterdex_error::IndexError;
use chapterdex_types::{Geometry, IndexConfig, RecordName};
use chapterdex_volume::{SubIndexKind, VolumeEventLog, VolumeIndex, VolumeIndexEvent};

fn dense_config(chapters: u64) -> IndexConfig {
    IndexConfig::new(Geometry::new(1024, chapters)).with_min_delta_lists(16)
}

fn sparse_config(zones: u32) -> IndexConfig {
    let geometry = Geometry::new(1024, 32).with_sparse_chapters(24);
    IndexConfig::new(geometry)
        .with_sample_rate(8)
        .with_zone_count(zones)
        .with_min_delta_lists(16)
}

fn names(seed: u64, count: usize) -> Vec<RecordName> {
    (0..count as u64)
        .map(|i| {
            let mut data = seed.to_le_bytes().to_vec();
            data.extend_from_slice(&i.to_le_bytes());
            RecordName::from_data(&data)
        })
        .collect()
}

fn insert(index: &mut VolumeIndex, name: &RecordName, chapter: u64) {
    let mut record = index.get_record(name).expect("get");
    index.put_record(&mut record, chapter).expect("put");
}

fn chapter_of(index: &mut VolumeIndex, name: &RecordName) -> Option<u64> {
    index.get_record(name).expect("get").virtual_chapter()
}

#[test]
fn test_put_then_get_reports_chapter() {
    let mut index = VolumeIndex::new(&dense_config(16), 1).expect("index");
    index.set_open_chapter(0);
    let names = names(1, 500);
    for name in &names {
        let record = index.get_record(name).expect("get");
        assert!(!record.is_found());
        assert_eq!(record.virtual_chapter(), None);
        insert(&mut index, name, 0);
    }
    for name in &names {
        assert_eq!(chapter_of(&mut index, name), Some(0));
    }
    let (dense, sample) = index.stats();
    assert_eq!(dense.record_count, 500);
    assert_eq!(sample.record_count, 0);
    assert!(index.memory_used() > 0);
}

#[test]
fn test_lazy_flush_drops_expired_chapters() {
    let mut index = VolumeIndex::new(&dense_config(10), 2).expect("index");
    let mut by_chapter = Vec::new();
    for chapter in 0..15u64 {
        index.set_open_chapter(chapter);
        let batch = names(100 + chapter, 20);
        for name in &batch {
            insert(&mut index, name, chapter);
        }
        by_chapter.push(batch);
    }
    assert_eq!(index.window(0), (5, 14));

    for name in &by_chapter[2] {
        assert_eq!(chapter_of(&mut index, name), None);
    }
    for chapter in 5..15u64 {
        for name in &by_chapter[chapter as usize] {
            assert_eq!(chapter_of(&mut index, name), Some(chapter));
        }
    }
    // Every expired entry a lookup touched is gone for good.
    let records = index.stats().0.record_count;
    assert!(records >= 200);
    assert!(records < 300);
}

#[test]
fn test_window_wraps_index_chapters() {
    let mut index = VolumeIndex::new(&dense_config(10), 3).expect("index");
    let names = names(3, 8);
    for chapter in 0..60u64 {
        index.set_open_chapter(chapter);
        let name = &names[(chapter % 8) as usize];
        let mut record = index.get_record(name).expect("get");
        if record.is_found() {
            index
                .set_record_chapter(&mut record, chapter)
                .expect("move");
        } else {
            index.put_record(&mut record, chapter).expect("put");
        }
    }
    assert_eq!(index.window(0), (50, 59));
    for (slot, name) in names.iter().enumerate() {
        let newest = 59 - ((59 - slot as u64) % 8);
        assert_eq!(chapter_of(&mut index, name), Some(newest));
    }
}

#[test]
fn test_set_record_chapter_and_remove() {
    let mut index = VolumeIndex::new(&dense_config(16), 4).expect("index");
    let name = names(4, 1)[0];
    index.set_open_chapter(3);
    insert(&mut index, &name, 3);
    index.set_open_chapter(7);

    let mut record = index.get_record(&name).expect("get");
    assert_eq!(record.virtual_chapter(), Some(3));
    index.set_record_chapter(&mut record, 7).expect("move");
    assert_eq!(chapter_of(&mut index, &name), Some(7));

    let mut record = index.get_record(&name).expect("get");
    let err = index
        .set_record_chapter(&mut record, 8)
        .expect_err("beyond the open chapter");
    assert!(matches!(err, IndexError::InvalidArgument { .. }));

    index.remove_record(&mut record).expect("remove");
    assert!(!record.is_valid());
    assert_eq!(chapter_of(&mut index, &name), None);
    let err = index.remove_record(&mut record).expect_err("removed twice");
    assert!(matches!(err, IndexError::BadState { .. }));
}

#[test]
fn test_colliding_addresses_keep_both_names() {
    let mut index = VolumeIndex::new(&dense_config(16), 5).expect("index");
    let first = RecordName::from_data(b"first block");
    let mut second = RecordName::from_data(b"second block");
    second.set_volume_index_bytes(first.volume_index_bytes());
    index.set_open_chapter(4);

    insert(&mut index, &first, 2);
    let mut record = index.get_record(&second).expect("get");
    assert!(record.is_found());
    assert!(!record.is_collision());
    assert_eq!(record.virtual_chapter(), Some(2));
    index.put_record(&mut record, 4).expect("put collision");
    assert!(record.is_collision());

    let record = index.get_record(&second).expect("get");
    assert!(record.is_collision());
    assert_eq!(record.virtual_chapter(), Some(4));
    assert_eq!(chapter_of(&mut index, &first), Some(2));
    assert_eq!(index.stats().0.collision_count, 1);
}

#[test]
fn test_handle_rejects_other_zones() {
    let mut index = VolumeIndex::new(&dense_config(16).with_zone_count(2), 6).expect("index");
    let name = names(6, 64)
        .into_iter()
        .find(|name| index.zone_for_name(name) == 1)
        .expect("a name in zone 1");
    let mut handle = index.zone_handle(0).expect("zone 0");
    let err = handle.get_record(&name).expect_err("wrong zone");
    assert!(matches!(err, IndexError::InvalidArgument { .. }));

    let mut handle = index.zone_handle(1).expect("zone 1");
    handle.set_open_chapter(0);
    let mut record = handle.get_record(&name).expect("get");
    handle.put_record(&mut record, 0).expect("put");
    assert_eq!(record.zone_number(), 1);

    let mut other = index.zone_handle(0).expect("zone 0");
    let err = other.remove_record(&mut record).expect_err("wrong zone");
    assert!(matches!(err, IndexError::InvalidArgument { .. }));
}

#[test]
fn test_sampled_names_span_the_volume() {
    let mut index = VolumeIndex::new(&sparse_config(2), 7).expect("index");
    let mut by_chapter = Vec::new();
    for chapter in 0..40u64 {
        index.set_open_chapter(chapter);
        let batch = names(700 + chapter, 60);
        for name in &batch {
            insert(&mut index, name, chapter);
        }
        by_chapter.push(batch);
    }
    assert_eq!(index.window(0), (32, 39));
    let lookup = index.sample_lookup();
    assert_eq!(lookup.window(1), Some((8, 39)));

    let mut sampled = 0;
    for name in &by_chapter[35] {
        if index.is_sample(name) {
            sampled += 1;
            assert_eq!(index.lookup_name(name), Some(35));
        } else {
            assert_eq!(index.lookup_name(name), None);
        }
    }
    assert!(sampled > 0);

    for name in &by_chapter[20] {
        let record = index.get_record(name).expect("get");
        if index.is_sample(name) {
            assert_eq!(record.sub_index(), SubIndexKind::Sample);
            assert_eq!(record.virtual_chapter(), Some(20));
        } else {
            assert_eq!(record.sub_index(), SubIndexKind::Dense);
            assert_eq!(record.virtual_chapter(), None);
        }
    }
}

#[test]
fn test_full_list_drops_entry_and_reports() {
    let log = Arc::new(VolumeEventLog::new(16));
    let mut index = VolumeIndex::new(&dense_config(16), 8)
        .expect("index")
        .with_observer(log.clone());
    index.set_open_chapter(0);

    let mut first_drop = None;
    for address in 0..20_000u64 {
        let mut name = RecordName::from_data(&address.to_le_bytes());
        name.set_volume_index_bytes(address * 16);
        let mut record = index.get_record(&name).expect("get");
        match index.put_record(&mut record, 0) {
            Ok(()) => {}
            Err(err) if err.is_overflow() => {
                first_drop = Some(address);
                break;
            }
            Err(err) => panic!("unexpected error {err}"),
        }
    }
    let dropped_at = first_drop.expect("list eventually overflows");
    // A second drop in the same zone and chapter folds into the first event.
    let mut name = RecordName::from_data(&(dropped_at + 1).to_le_bytes());
    name.set_volume_index_bytes((dropped_at + 1) * 16);
    let mut record = index.get_record(&name).expect("get");
    let err = index.put_record(&mut record, 0).expect_err("list still full");
    assert!(err.is_overflow());
    assert_eq!(index.overflow_drops(), 2);
    assert_eq!(log.merged_overflows(), 1);
    assert_eq!(
        log.take(),
        vec![VolumeIndexEvent::EntryOverflow {
            sub_index: SubIndexKind::Dense,
            zone: 0,
            chapter: 0,
            dropped: 2,
        }]
    );

    // Still searchable after the drop.
    let mut name = RecordName::from_data(&0u64.to_le_bytes());
    name.set_volume_index_bytes(0);
    assert_eq!(chapter_of(&mut index, &name), Some(0));
    assert_eq!(index.stats().0.record_count, dropped_at);
}
