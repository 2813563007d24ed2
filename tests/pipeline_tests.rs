//! End-to-end passes: selection, merging and compression of whole events

mod common;

use common::{geometry, serial, serial_settings, EventBuilder};
use trackforge::data::{MergedClusterRef, MergedTrackFlags, TrackParam};
use trackforge::memory::{Arena, MemoryPool};
use trackforge::{
    ErrorCode, GatherMode, PipelineContext, ProcessingSettings, SliceOutput, TrackForgeError,
};

fn three_tracklets(noise: usize) -> EventBuilder {
    let mut event = EventBuilder::new(1, 16);
    for first_row in [0, 4, 8] {
        event.fresh_tracklet(0, first_row, 5, 1);
    }
    event.noise(0, 14, noise);
    event
}

#[test]
fn test_full_pass_over_one_partition() -> anyhow::Result<()> {
    let mut pipeline = PipelineContext::new(serial_settings(5), geometry(1, 16))?;
    let output = pipeline.process_event(&three_tracklets(4).build(), None)?;

    let partition = &output.partitions[0];
    assert!(partition.output_valid);
    assert_eq!(partition.tracks.len(), 3);
    assert_eq!(partition.hits.len(), 15);
    assert_eq!(partition.memory_size, 24 + 3 * 48 + 15 * 8);
    assert_eq!(partition.memory_size, SliceOutput::estimate_size(3, 15));

    assert_eq!(output.merged_tracks.len(), 3);
    assert!(output.merged_tracks.iter().all(|t| t.ok() && t.n_clusters == 5));
    assert_eq!(output.merged_refs.len(), 15);

    let compression = output.compression.expect("compression ran");
    assert!(compression.output_valid);
    assert_eq!(compression.counts.n_attached, 15);
    assert_eq!(compression.counts.n_unattached, 4);

    let stats = &output.stats;
    assert_eq!(stats.n_tracklets, 3);
    assert_eq!(stats.n_track_hits, 15);
    assert_eq!(stats.hits_per_track(), 5.0);
    assert_eq!(stats.compressed_bytes, compression.flat_size);
    assert_eq!(stats.gather.map(|g| g.mode), Some(GatherMode::HostStaging));
    assert!(output.errors.is_empty());
    assert!(output.fit_errors.is_empty());
    Ok(())
}

#[test]
fn test_compressed_event_decodes_to_input_clusters() -> anyhow::Result<()> {
    let mut pipeline = PipelineContext::new(serial_settings(5).with_track_model(true), geometry(1, 16))?;
    let input = three_tracklets(7).build();
    let output = pipeline.process_event(&input, None)?;

    let compressed = output.compressed.expect("output fits");
    let decoded = pipeline.decoder().decode(&compressed)?;
    assert_eq!(decoded.tracks.len(), 3);
    assert_eq!(decoded.n_attached(), 15);
    assert_eq!(decoded.unattached_row(0, 14), input.clusters.row(0, 14));

    for (track, refs) in decoded.tracks.iter().zip(output.merged_tracks.iter()) {
        let expected: Vec<_> = output.merged_refs[refs.cluster_range()]
            .iter()
            .map(|r| input.clusters.clusters()[r.index as usize])
            .collect();
        let got: Vec<_> = track.iter().map(|c| c.cluster).collect();
        assert_eq!(got, expected);
    }
    Ok(())
}

#[test]
fn test_arenas_reused_across_events() -> anyhow::Result<()> {
    let mut pipeline = PipelineContext::new(serial_settings(5), geometry(1, 16))?;
    let first = pipeline.process_event(&three_tracklets(4).build(), None)?;
    let allocations = first.stats.memory.arena_allocations;

    for _ in 0..3 {
        let output = pipeline.process_event(&three_tracklets(2).build(), None)?;
        assert_eq!(output.partitions[0].tracks, first.partitions[0].tracks);
        assert_eq!(output.stats.memory.arena_allocations, allocations);
    }
    assert_eq!(pipeline.events_processed(), 4);
    Ok(())
}

#[test]
fn test_invalid_event_leaves_pipeline_usable() -> anyhow::Result<()> {
    let mut pipeline = PipelineContext::new(serial_settings(5), geometry(1, 16))?;

    let mut bad = EventBuilder::new(1, 16);
    bad.tracklet(0, 0, &[99], 1);
    let err = pipeline.process_event(&bad.build(), None).unwrap_err();
    assert!(matches!(err, TrackForgeError::InvalidInput(_)));
    assert_eq!(pipeline.events_processed(), 0);

    let output = pipeline.process_event(&three_tracklets(0).build(), None)?;
    assert_eq!(output.partitions[0].tracks.len(), 3);
    assert_eq!(pipeline.events_processed(), 1);
    Ok(())
}

#[test]
fn test_compression_misfit_in_external_output() -> anyhow::Result<()> {
    let mut pipeline = PipelineContext::new(serial_settings(5), geometry(1, 16))?;
    pipeline.attach_external_output(Arena::new(MemoryPool::External, 8192)?)?;

    let mut event = EventBuilder::new(1, 16);
    event.fresh_tracklet(0, 0, 6, 1);
    event.noise(0, 10, 2000);
    let output = pipeline.process_event(&event.build(), None)?;

    // merged tracks still fit, the compressed block does not
    assert_eq!(output.merged_tracks.len(), 1);
    assert!(output.compressed.is_none());
    assert_eq!(output.compression.map(|c| c.output_valid), Some(false));
    assert_eq!(output.stats.compressed_bytes, 0);
    assert_eq!(output.fit_errors.len(), 1);
    assert_eq!(output.fit_errors[0].resource, "compressor.output");

    let arena = pipeline.detach_external_output().expect("attached");
    assert_eq!(arena.capacity(), 8192);
    let output = pipeline.process_event(&event_with_one_track(), None)?;
    assert!(output.compressed.is_some());
    Ok(())
}

#[test]
fn test_external_output_receives_compressed_block() -> anyhow::Result<()> {
    let mut pipeline = PipelineContext::new(serial_settings(5), geometry(1, 16))?;
    pipeline.attach_external_output(Arena::new(MemoryPool::External, 1 << 20)?)?;

    let output = pipeline.process_event(&three_tracklets(5).build(), None)?;
    assert!(output.fit_errors.is_empty());
    let compressed = output.compressed.expect("output fits");
    assert_eq!(compressed.header.n_attached, 15);
    assert_eq!(compressed.header.n_unattached, 5);
    Ok(())
}

#[test]
#[serial]
fn test_settings_from_environment() -> anyhow::Result<()> {
    std::env::set_var("TRACKFORGE_GATHER_MODE", "2");
    std::env::set_var("TRACKFORGE_MIN_TRACK_CLUSTERS", "6");
    let settings = ProcessingSettings::from_env();
    std::env::remove_var("TRACKFORGE_GATHER_MODE");
    std::env::remove_var("TRACKFORGE_MIN_TRACK_CLUSTERS");

    let settings = settings?.with_execution(serial_settings(6).execution);
    assert_eq!(settings.gather_mode, GatherMode::Direct);
    let mut pipeline = PipelineContext::new(settings, geometry(1, 16))?;
    let output = pipeline.process_event(&three_tracklets(0).build(), None)?;

    // five-hit tracklets fall below the minimum of six
    assert!(output.partitions[0].tracks.is_empty());
    assert_eq!(output.stats.gather.map(|g| g.copies), Some(0));
    Ok(())
}

#[test]
fn test_facing_partitions_merge_into_one_track() -> anyhow::Result<()> {
    let mut pipeline = PipelineContext::new(serial_settings(5), geometry(2, 16))?;
    let state = TrackParam::new(85.0, 0.0, 0.0, 0.0, 0.0, 0.5);
    let mut event = EventBuilder::new(2, 16);
    let a_hits = event.tracklet_with_param(0, 0, 7, state);
    let c_hits = event.tracklet_with_param(1, 3, 5, state);
    let input = event.build();
    let output = pipeline.process_event(&input, None)?;

    assert_eq!(output.merger.n_segments, 2);
    assert_eq!(output.merger.n_links, 1);
    assert_eq!(output.merged_tracks.len(), 1);
    let track = output.merged_tracks[0];
    assert_eq!(track.flags(), MergedTrackFlags::OK | MergedTrackFlags::CROSS_PARTITION);
    assert_eq!(track.n_clusters, 12);
    assert_eq!(track.n_clusters_fitted, 12);

    // A-side segment first, then the C-side one, each in row order
    let expected: Vec<(u8, u16, u32)> = a_hits
        .iter()
        .enumerate()
        .map(|(i, &h)| (0, i as u16, input.clusters.global_index(0, i, h as usize).unwrap()))
        .chain(c_hits.iter().enumerate().map(|(i, &h)| {
            (1, 3 + i as u16, input.clusters.global_index(1, 3 + i, h as usize).unwrap())
        }))
        .collect();
    let got: Vec<(u8, u16, u32)> = output.merged_refs[track.cluster_range()]
        .iter()
        .map(|r| (r.partition, r.row, r.index))
        .collect();
    assert_eq!(got, expected);
    assert!(output.merged_refs.iter().all(|r| r.state & MergedClusterRef::FITTED != 0));

    let compression = output.compression.expect("compression ran");
    assert_eq!(compression.counts.n_tracks, 1);
    assert_eq!(compression.counts.n_attached, 12);
    Ok(())
}

#[test]
fn test_looper_segments_merge_and_stay_flagged() -> anyhow::Result<()> {
    let mut pipeline = PipelineContext::new(serial_settings(5), geometry(2, 16))?;
    let looper = TrackParam::new(85.0, 0.0, 0.0, 0.0, 0.0, 6.0);
    let mut event = EventBuilder::new(2, 16);
    event.tracklet_with_param(0, 0, 7, looper);
    event.tracklet_with_param(0, 8, 6, TrackParam::new(93.0, 100.0, 0.0, 0.0, 0.0, 0.5));
    event.tracklet_with_param(1, 0, 5, looper);
    let output = pipeline.process_event(&event.build(), None)?;

    assert_eq!(output.merged_tracks.len(), 2);
    let merged = output.merged_tracks[0];
    assert_eq!(
        merged.flags(),
        MergedTrackFlags::OK
            | MergedTrackFlags::LOOPER
            | MergedTrackFlags::MERGED_LOOPER
            | MergedTrackFlags::CROSS_PARTITION
    );
    assert_eq!(merged.n_clusters, 12);

    // far away in y: stays alone and is no looper
    let single = output.merged_tracks[1];
    assert_eq!(single.flags(), MergedTrackFlags::OK);
    assert_eq!(single.n_clusters, 6);
    assert_eq!(single.n_clusters_fitted, 6);
    Ok(())
}

#[test]
fn test_merger_misfit_is_a_fit_error_not_an_overflow() -> anyhow::Result<()> {
    let mut pipeline = PipelineContext::new(serial_settings(5), geometry(1, 16))?;
    pipeline.attach_external_output(Arena::new(MemoryPool::External, 256)?)?;

    let output = pipeline.process_event(&three_tracklets(2).build(), None)?;
    assert_eq!(output.partitions[0].tracks.len(), 3);
    assert!(output.merged_tracks.is_empty());
    assert!(!output.merger.output_valid);
    assert!(!output.has_error(ErrorCode::MergerTrackOverflow));
    assert!(output.errors.is_empty());

    let misfits: Vec<&str> = output.fit_errors.iter().map(|e| e.resource.as_str()).collect();
    assert_eq!(misfits, vec!["merger.output", "compressor.output"]);
    Ok(())
}

#[test]
fn test_compressed_output_beyond_fallback_reserve() -> anyhow::Result<()> {
    const ROWS: usize = 152;
    const PER_ROW: usize = 9000;
    let settings = serial_settings(5).with_gather_mode(GatherMode::Direct);
    let reserve = settings.memory.custom_reserve_bytes;
    let mut pipeline = PipelineContext::new(settings, geometry(1, ROWS))?;

    let mut event = EventBuilder::new(1, ROWS);
    for row in 0..ROWS {
        event.noise(0, row, PER_ROW);
    }
    let output = pipeline.process_event(&event.build(), None)?;

    let compression = output.compression.expect("compression ran");
    assert!(compression.output_valid);
    assert_eq!(compression.counts.n_unattached, ROWS * PER_ROW);
    assert!(compression.flat_size > reserve);
    assert_eq!(output.stats.compressed_bytes, compression.flat_size);
    let compressed = output.compressed.expect("output placed");
    assert_eq!(compressed.header.n_unattached as usize, ROWS * PER_ROW);
    Ok(())
}

fn event_with_one_track() -> trackforge::EventInput {
    let mut event = EventBuilder::new(1, 16);
    event.fresh_tracklet(0, 0, 6, 1);
    event.build()
}
