//! Persistence round-trips and cross-restart semantics.

use std::collections::BTreeSet;

use anticrop_scan::{ScanConfidence, ScanVerdict};
use anticrop_state::{
    BotState, ChannelId, GuildId, MessageId, OptOutFlag, Permission, ScanPhase, StateStore,
    ThreadId, UserId,
};

fn store_in(dir: &tempfile::TempDir) -> StateStore {
    StateStore::new(dir.path().join("state.bin"))
}

#[test]
fn load_without_blob_yields_fresh_state() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir);
    let state = store.load().unwrap();
    assert!(state.active_guilds().is_empty());
}

#[test]
fn state_survives_a_save_load_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir);

    let guild = GuildId(100);
    let state = BotState::new();
    state.set_deletion_threshold(guild, ScanConfidence::Medium);
    state.opt_out(UserId(7), OptOutFlag::Archiving);

    let scan = state
        .begin_scan(guild, UserId(1), Some(ScanConfidence::Medium))
        .unwrap();
    let channel = scan.channel_state(ChannelId(200));
    channel.cursor.advance_to(MessageId(555));
    channel.thread_state(ThreadId(300)).cursor.mark_exhausted();
    let mut missing = BTreeSet::new();
    missing.insert(Permission::ReadHistory);
    scan.channel_state(ChannelId(201))
        .record_missing_permissions(missing);
    scan.record_verdict(ScanVerdict::Confidence(ScanConfidence::High));
    scan.record_verdict(ScanVerdict::OptedOut);
    scan.begin_closing();
    scan.with_closing(|closing| {
        closing.uploaded.insert(UserId(7));
        closing.requester_notified = true;
    });

    store.save(&state).unwrap();
    let restored = store.load().unwrap();

    assert_eq!(restored.active_guilds(), vec![guild]);
    assert_eq!(restored.deletion_threshold(guild), ScanConfidence::Medium);
    assert!(restored.is_opted_out(UserId(7), OptOutFlag::Archiving));

    let scan = restored.scan(guild).unwrap();
    assert_eq!(scan.requester(), UserId(1));
    assert_eq!(scan.threshold(), Some(ScanConfidence::Medium));
    assert_eq!(scan.phase(), ScanPhase::Closing);
    assert_eq!(
        scan.channel_state(ChannelId(200)).cursor.get(),
        MessageId(555)
    );
    assert!(scan
        .channel_state(ChannelId(200))
        .thread_state(ThreadId(300))
        .cursor
        .is_exhausted());
    assert!(scan.channel_state(ChannelId(201)).is_permission_skipped());
    assert_eq!(scan.tally().at_or_above(ScanConfidence::High), 1);
    assert_eq!(scan.tally().opted_out(), 1);
    assert_eq!(
        scan.with_closing(|closing| {
            (closing.requester_notified, closing.uploaded.contains(&UserId(7)))
        }),
        Some((true, true))
    );
}

#[test]
fn save_leaves_no_temp_file_behind() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir);
    store.save(&BotState::new()).unwrap();
    store.save(&BotState::new()).unwrap();

    let names: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert_eq!(names, vec![std::ffi::OsString::from("state.bin")]);
}

#[test]
fn corrupt_blob_fails_loudly() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir);
    std::fs::write(store.path(), b"\xFF\xFF\xFF garbage").unwrap();
    assert!(store.load().is_err());
}

#[test]
fn finished_threshold_recorded_on_finish() {
    let state = BotState::new();
    let guild = GuildId(5);
    state
        .begin_scan(guild, UserId(1), Some(ScanConfidence::High))
        .unwrap();
    state.finish_scan(guild, Some(ScanConfidence::High));
    assert!(!state.scan_active(guild));
    assert_eq!(state.previous_scan(guild), Some(Some(ScanConfidence::High)));
}
