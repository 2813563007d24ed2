//! Tracklet selection through the full pipeline

mod common;

use common::{geometry, parallel_settings, serial_settings, EventBuilder};
use trackforge::data::{ClusterRef, NO_HIT};
use trackforge::error::ErrorCode;
use trackforge::PipelineContext;

fn run(builder: EventBuilder, settings: trackforge::ProcessingSettings) -> trackforge::EventOutput {
    let geometry = geometry(builder.n_partitions(), builder.n_rows());
    let mut pipeline = PipelineContext::new(settings, geometry).expect("pipeline");
    pipeline.process_event(&builder.build(), None).expect("event")
}

#[test]
fn test_owned_tracklet_becomes_one_track_in_row_order() {
    let mut event = EventBuilder::new(1, 16);
    let hits = event.fresh_tracklet(0, 3, 8, 1);

    let output = run(event, serial_settings(5));
    let partition = &output.partitions[0];
    assert_eq!(partition.tracks.len(), 1);
    assert_eq!(partition.tracks[0].n_hits, 8);
    assert_eq!(partition.tracks[0].tracklet, 0);

    let expected: Vec<ClusterRef> = hits
        .iter()
        .enumerate()
        .map(|(k, &h)| ClusterRef::new(3 + k as u32, h))
        .collect();
    assert_eq!(partition.hits, expected);
}

#[test]
fn test_lower_weight_owns_shared_hits() {
    let mut event = EventBuilder::new(1, 16);
    let hits = event.fresh_tracklet(0, 0, 6, 1);
    event.tracklet(0, 0, &hits, 5);

    let output = run(event, serial_settings(5));
    let tracks = &output.partitions[0].tracks;
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].tracklet, 0);
}

#[test]
fn test_owner_follows_weight_not_order() {
    let mut event = EventBuilder::new(1, 16);
    let hits = event.fresh_tracklet(0, 0, 6, 5);
    event.tracklet(0, 0, &hits, 1);

    let output = run(event, serial_settings(5));
    let tracks = &output.partitions[0].tracks;
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].tracklet, 1);
}

#[test]
fn test_equal_weights_both_keep_hits() {
    let mut event = EventBuilder::new(1, 16);
    let hits = event.fresh_tracklet(0, 0, 6, 3);
    event.tracklet(0, 0, &hits, 3);

    let output = run(event, serial_settings(5));
    assert_eq!(output.partitions[0].tracks.len(), 2);
    assert_eq!(output.partitions[0].hits.len(), 12);
}

#[test]
fn test_bounded_fraction_of_shared_hits_accepted() {
    let mut event = EventBuilder::new(1, 20);
    let owner = event.fresh_tracklet(0, 10, 6, 1);
    let mut hits: Vec<u32> = (0..10).map(|row| event.add_cluster(0, row)).collect();
    hits.push(owner[0]);
    event.tracklet(0, 0, &hits, 2);

    let output = run(event, serial_settings(5));
    let partition = &output.partitions[0];
    assert_eq!(partition.tracks.len(), 2);
    // ordered by tracklet index
    assert_eq!(partition.tracks[0].n_hits, 6);
    assert_eq!(partition.tracks[1].n_hits, 11);
    assert_eq!(partition.tracks[1].first_hit, 6);
}

#[test]
fn test_row_gap_splits_track() {
    let mut event = EventBuilder::new(1, 24);
    let mut hits = Vec::new();
    for row in 0..6 {
        hits.push(event.add_cluster(0, row));
    }
    hits.extend(std::iter::repeat(NO_HIT).take(5));
    for row in 11..17 {
        hits.push(event.add_cluster(0, row));
    }
    event.tracklet(0, 0, &hits, 1);

    let output = run(event, serial_settings(5));
    let tracks = &output.partitions[0].tracks;
    assert_eq!(tracks.len(), 2);
    assert_eq!(tracks[0].n_hits, 6);
    assert_eq!(tracks[1].n_hits, 6);
    assert_eq!(output.partitions[0].hits[6].row, 11);
}

#[test]
fn test_short_tracklet_rejected() {
    let mut event = EventBuilder::new(1, 16);
    event.fresh_tracklet(0, 0, 4, 1);

    let output = run(event, serial_settings(5));
    assert!(output.partitions[0].tracks.is_empty());
    assert_eq!(output.partitions[0].memory_size, 24);
}

#[test]
fn test_track_overflow_drops_partition_output() {
    let mut event = EventBuilder::new(1, 16);
    for _ in 0..3 {
        event.fresh_tracklet(0, 0, 5, 1);
    }

    let output = run(event, serial_settings(5).with_track_capacity(2, 100));
    let partition = &output.partitions[0];
    assert!(partition.selector.overflow);
    assert!(partition.tracks.is_empty());
    assert_eq!(partition.selector.n_tracks, 0);

    let overflow = output
        .errors
        .iter()
        .find(|e| e.code == ErrorCode::TrackOverflow)
        .expect("overflow raised");
    assert_eq!(overflow.code.name(), "ERROR_TRACK_OVERFLOW");
    assert_eq!(overflow.partition, 0);
    assert_eq!(overflow.observed, 3);
    assert_eq!(overflow.capacity, 2);
}

#[test]
fn test_track_hit_overflow() {
    let mut event = EventBuilder::new(1, 16);
    event.fresh_tracklet(0, 0, 5, 1);
    event.fresh_tracklet(0, 0, 5, 1);

    let output = run(event, serial_settings(5).with_track_capacity(10, 8));
    assert!(output.partitions[0].selector.overflow);
    assert!(output.has_error(ErrorCode::TrackHitOverflow));
    assert!(output.partitions[0].tracks.is_empty());
}

#[test]
fn test_parallel_selection_matches_serial() {
    let build = || {
        let mut event = EventBuilder::new(2, 32);
        for p in 0..2 {
            for t in 0..20u32 {
                let hits = event.fresh_tracklet(p, (t % 10) as usize, 8 + (t % 5) as usize, t % 3);
                if t % 4 == 0 {
                    event.tracklet(p, (t % 10) as usize, &hits, 7);
                }
            }
            event.noise(p, 5, 3);
        }
        event
    };

    let serial = run(build(), serial_settings(5));
    let parallel = run(build(), parallel_settings(5));
    for p in 0..2 {
        assert_eq!(serial.partitions[p].tracks, parallel.partitions[p].tracks);
        assert_eq!(serial.partitions[p].hits, parallel.partitions[p].hits);
    }
}
