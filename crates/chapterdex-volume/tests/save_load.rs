use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::sync::Arc;

use chapterdex_error::IndexError;
use chapterdex_types::{Geometry, IndexConfig, RecordName};
use chapterdex_volume::{
    SUB_INDEX_HEADER_SIZE, VOLUME_INDEX_HEADER_SIZE, VolumeEventLog, VolumeIndex,
    VolumeIndexEvent,
};
use tempfile::tempdir;

const NONCE: u64 = 0x5eed_0f_c4a9;

fn sparse_config(zones: u32) -> IndexConfig {
    let geometry = Geometry::new(1024, 32).with_sparse_chapters(24);
    IndexConfig::new(geometry)
        .with_sample_rate(8)
        .with_zone_count(zones)
        .with_min_delta_lists(16)
}

fn dense_config(zones: u32) -> IndexConfig {
    IndexConfig::new(Geometry::new(1024, 16))
        .with_zone_count(zones)
        .with_min_delta_lists(16)
}

/// Fill chapters `0..=last`, returning the names and the chapter each
/// ended up in.
fn populate(index: &mut VolumeIndex, last: u64, per_chapter: u64) -> Vec<(RecordName, u64)> {
    let mut inserted = Vec::new();
    for chapter in 0..=last {
        index.set_open_chapter(chapter);
        for i in 0..per_chapter {
            let name = RecordName::from_data(&(chapter * 10_000 + i).to_le_bytes());
            let mut record = index.get_record(&name).expect("get");
            index.put_record(&mut record, chapter).expect("put");
            inserted.push((name, chapter));
        }
    }
    inserted
}

fn save_to_buffers(index: &VolumeIndex) -> Vec<Vec<u8>> {
    let mut buffers = vec![Vec::new(); index.zone_count() as usize];
    index.save(&mut buffers).expect("save");
    buffers
}

/// Every name a lookup would still report.
fn assert_live(index: &mut VolumeIndex, inserted: &[(RecordName, u64)]) {
    let (dense_low, high) = index.window(0);
    let sample_low = index.sample_lookup().window(0).map_or(dense_low, |w| w.0);
    for (name, chapter) in inserted {
        let low = if index.is_sample(name) {
            sample_low
        } else {
            dense_low
        };
        let found = index.get_record(name).expect("get").virtual_chapter();
        if (low..=high).contains(chapter) {
            assert_eq!(found, Some(*chapter));
        } else {
            assert_eq!(found, None);
        }
    }
}

#[test]
fn test_sparse_round_trip_across_zone_counts() {
    let mut index = VolumeIndex::new(&sparse_config(4), NONCE).expect("index");
    let inserted = populate(&mut index, 40, 40);
    let buffers = save_to_buffers(&index);
    for buffer in &buffers {
        assert!(buffer.len() <= VolumeIndex::compute_save_bytes(&sparse_config(4)).expect("bound"));
        assert_eq!(&buffer[..8], b"MI6-0001");
        assert_eq!(&buffer[VOLUME_INDEX_HEADER_SIZE..VOLUME_INDEX_HEADER_SIZE + 8], b"MI5-0005");
    }

    for zones in [1u32, 2, 3, 4] {
        let mut restored = VolumeIndex::new(&sparse_config(zones), 0).expect("index");
        let mut readers: Vec<&[u8]> = buffers.iter().map(Vec::as_slice).collect();
        restored.load(&mut readers).expect("load");
        assert!(readers.iter().all(|reader| reader.is_empty()));
        assert_eq!(restored.nonce(), NONCE);
        for zone in 0..zones {
            assert_eq!(restored.window(zone), (33, 40));
            assert_eq!(restored.sample_lookup().window(zone), Some((9, 40)));
        }
        let (dense, sample) = restored.stats();
        let (saved_dense, saved_sample) = index.stats();
        assert_eq!(dense.record_count, saved_dense.record_count);
        assert_eq!(sample.record_count, saved_sample.record_count);
        assert_live(&mut restored, &inserted);
    }
}

#[test]
fn test_dense_round_trip_through_files() {
    let dir = tempdir().expect("tempdir");
    let mut index = VolumeIndex::new(&dense_config(2), NONCE).expect("index");
    let inserted = populate(&mut index, 20, 50);

    let paths: Vec<_> = (0..2)
        .map(|zone| dir.path().join(format!("zone-{zone}.vi")))
        .collect();
    let mut writers: Vec<BufWriter<File>> = paths
        .iter()
        .map(|path| BufWriter::new(File::create(path).expect("create")))
        .collect();
    index.save(&mut writers).expect("save");
    drop(writers);

    let mut readers: Vec<BufReader<File>> = paths
        .iter()
        .map(|path| BufReader::new(File::open(path).expect("open")))
        .collect();
    let mut restored = VolumeIndex::new(&dense_config(2), NONCE).expect("index");
    restored.load(&mut readers).expect("load");
    assert_eq!(restored.window(1), (5, 20));
    assert_live(&mut restored, &inserted);
}

fn restore_fails(config: &IndexConfig, nonce: u64, buffers: &[Vec<u8>]) -> IndexError {
    let log = Arc::new(VolumeEventLog::new(4));
    let mut restored = VolumeIndex::new(config, nonce)
        .expect("index")
        .with_observer(log.clone());
    // A failed restore must wipe earlier contents too.
    populate(&mut restored, 3, 10);
    let mut readers: Vec<&[u8]> = buffers.iter().map(Vec::as_slice).collect();
    let err = restored.load(&mut readers).expect_err("bad streams");
    assert_eq!(restored.combined_stats().record_count, 0);
    assert_eq!(restored.memory_used(), 0);
    assert_eq!(restored.nonce(), nonce);
    for zone in 0..restored.zone_count() {
        assert_eq!(restored.window(zone), (0, 0));
    }
    assert_eq!(
        log.take().last(),
        Some(&VolumeIndexEvent::RestoreAborted { error: err.kind() })
    );
    err
}

#[test]
fn test_nonce_mismatch_is_corrupt() {
    let mut index = VolumeIndex::new(&dense_config(1), NONCE).expect("index");
    populate(&mut index, 2, 10);
    let buffers = save_to_buffers(&index);
    let err = restore_fails(&dense_config(1), NONCE + 1, &buffers);
    assert!(err.is_corrupt());
}

#[test]
fn test_sample_rate_mismatch_is_corrupt() {
    let mut index = VolumeIndex::new(&sparse_config(1), NONCE).expect("index");
    populate(&mut index, 2, 10);
    let buffers = save_to_buffers(&index);
    let config = sparse_config(1).with_sample_rate(16);
    assert!(restore_fails(&config, 0, &buffers).is_corrupt());
}

#[test]
fn test_damaged_streams_leave_index_empty() {
    let config = sparse_config(2);
    let mut index = VolumeIndex::new(&config, NONCE).expect("index");
    populate(&mut index, 12, 30);
    let buffers = save_to_buffers(&index);
    let dense_header = VOLUME_INDEX_HEADER_SIZE;

    let mut bad_volume_magic = buffers.clone();
    bad_volume_magic[1][0] = b'X';
    assert!(restore_fails(&config, 0, &bad_volume_magic).is_corrupt());

    let mut bad_sub_index_magic = buffers.clone();
    bad_sub_index_magic[0][dense_header + 1] = b'X';
    assert!(restore_fails(&config, 0, &bad_sub_index_magic).is_corrupt());

    let mut split_high = buffers.clone();
    split_high[1][dense_header + 24..dense_header + 32].copy_from_slice(&99u64.to_le_bytes());
    assert!(restore_fails(&config, 0, &split_high).is_corrupt());

    let mut too_many_lists = buffers.clone();
    too_many_lists[1][dense_header + 36..dense_header + SUB_INDEX_HEADER_SIZE]
        .copy_from_slice(&1000u32.to_le_bytes());
    assert!(restore_fails(&config, 0, &too_many_lists).is_corrupt());

    let mut bad_guard = buffers.clone();
    let last = bad_guard[0].len() - 8;
    bad_guard[0][last] = b'd';
    assert!(restore_fails(&config, 0, &bad_guard).is_corrupt());

    let mut truncated = buffers.clone();
    let keep = truncated[1].len() - 20;
    truncated[1].truncate(keep);
    assert!(matches!(
        restore_fails(&config, 0, &truncated),
        IndexError::Io(_)
    ));

    let dense_only = dense_config(2);
    assert!(restore_fails(&dense_only, 0, &buffers).is_corrupt());
}

#[test]
fn test_failed_load_leaves_nonce_open_for_adoption() {
    let config = sparse_config(2);
    let mut first = VolumeIndex::new(&config, NONCE).expect("index");
    populate(&mut first, 4, 20);
    let mut damaged = save_to_buffers(&first);
    // Stream 0 hands over its nonce before stream 1 fails.
    damaged[1][VOLUME_INDEX_HEADER_SIZE + 1] = b'X';

    let mut other = VolumeIndex::new(&config, NONCE + 7).expect("index");
    let inserted = populate(&mut other, 4, 20);
    let good = save_to_buffers(&other);

    let mut restored = VolumeIndex::new(&config, 0).expect("index");
    let mut readers: Vec<&[u8]> = damaged.iter().map(Vec::as_slice).collect();
    assert!(restored.load(&mut readers).expect_err("damaged").is_corrupt());
    assert_eq!(restored.nonce(), 0);

    let mut readers: Vec<&[u8]> = good.iter().map(Vec::as_slice).collect();
    restored.load(&mut readers).expect("adopts the second volume");
    assert_eq!(restored.nonce(), NONCE + 7);
    assert_live(&mut restored, &inserted);
}

#[test]
fn test_lowest_window_wins_across_streams() {
    let config = dense_config(2);
    let mut index = VolumeIndex::new(&config, NONCE).expect("index");
    populate(&mut index, 30, 20);
    index.set_zone_open_chapter(0, 31).expect("open");
    index.set_zone_open_chapter(1, 31).expect("open");
    let mut buffers = save_to_buffers(&index);
    // Pretend zone 1 had expired one more chapter early.
    buffers[1][16..24].copy_from_slice(&17u64.to_le_bytes());

    let mut restored = VolumeIndex::new(&config, 0).expect("index");
    let mut readers: Vec<&[u8]> = buffers.iter().map(Vec::as_slice).collect();
    restored.load(&mut readers).expect("load");
    assert_eq!(restored.window(0), (17, 31));
    assert_eq!(restored.window(1), (17, 31));
}

#[test]
fn test_removals_after_restore_keep_totals() {
    let config = dense_config(3);
    let mut index = VolumeIndex::new(&config, NONCE).expect("index");
    let inserted = populate(&mut index, 4, 60);
    let buffers = save_to_buffers(&index);

    let mut restored = VolumeIndex::new(&config, NONCE).expect("index");
    let mut readers: Vec<&[u8]> = buffers.iter().map(Vec::as_slice).collect();
    restored.load(&mut readers).expect("load");

    // Restored totals all land in one zone; removing from the others must
    // still balance out.
    let mut removed = 0;
    for (name, _) in &inserted {
        if restored.zone_for_name(name) == 0 {
            continue;
        }
        let mut record = restored.get_record(name).expect("get");
        restored.remove_record(&mut record).expect("remove");
        removed += 1;
    }
    assert!(removed > 0);
    assert_eq!(
        restored.combined_stats().record_count,
        inserted.len() as u64 - removed
    );
}
