use flagrelay_lib::counter::hour_bucket;
use flagrelay_lib::telemetry::{Endpoint, ProxyTelemetry};
use flagrelay_lib::{
    ChangeSummaries, Impression, ImpressionObserver, ImpressionsCounter, OperationGate,
    OperationKind, Split, SplitStatus,
};

fn impression(key: &str, time: i64) -> Impression {
    Impression {
        key_name: key.to_string(),
        bucketing_key: None,
        treatment: "on".to_string(),
        time,
        change_number: 1,
        label: "in segment all".to_string(),
        previous_time: None,
    }
}

fn split(name: &str, change_number: i64) -> Split {
    Split {
        name: name.to_string(),
        traffic_type_name: "user".to_string(),
        status: SplitStatus::Active,
        killed: false,
        default_treatment: "off".to_string(),
        change_number,
        conditions: serde_json::Value::Null,
    }
}

#[test]
fn repeated_impressions_collapse_into_one_forward_and_a_counter() {
    let mut observer = ImpressionObserver::new(1000);
    let counter = ImpressionsCounter::new();

    let mut forwarded = 0;
    for n in 0..100 {
        let imp = impression("u", 1_000 + n);
        match observer.test_and_set("x", &imp) {
            None => forwarded += 1,
            Some(_) => counter.inc("x", imp.time, 1),
        }
    }

    assert_eq!(forwarded, 1);
    let counts = counter.pop_all().per_feature;
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].feature, "x");
    assert_eq!(counts[0].time_frame, hour_bucket(1_000));
    assert_eq!(counts[0].count, 99);
}

#[test]
fn summaries_replay_reconstructs_client_state() {
    // A client applying every summary in order ends up with exactly the
    // names the authority considers live.
    let mut summaries = ChangeSummaries::default();
    summaries.add_changes(10, vec!["a".into(), "b".into()], vec![]);
    summaries.add_changes(20, vec!["c".into()], vec!["a".into()]);
    summaries.add_changes(30, vec!["a".into()], vec!["b".into()]);

    let mut client: std::collections::HashSet<String> = Default::default();
    let (summary, till) = summaries.fetch_since(0).unwrap();
    for name in &summary.updated {
        client.insert(name.clone());
    }
    for name in &summary.removed {
        client.remove(name);
    }
    assert_eq!(till, 30);
    let mut live: Vec<&str> = client.iter().map(|s| s.as_str()).collect();
    live.sort();
    assert_eq!(live, vec!["a", "c"]);
}

#[test]
fn summaries_incremental_steps_match_full_replay() {
    let mut summaries = ChangeSummaries::default();
    summaries.add_changes(10, vec!["a".into(), "b".into()], vec![]);
    summaries.add_changes(20, vec!["c".into()], vec!["a".into()]);

    // Step 1: client at -1 catches up to 10, then applies (10, 20].
    let (step, till) = summaries.fetch_since(10).unwrap();
    assert_eq!(till, 20);
    assert!(step.updated.contains("c"));
    assert!(step.removed.contains("a"));
    assert!(!step.updated.contains("b"));

    // Full replay lands on the same final set.
    let (full, _) = summaries.fetch_since(0).unwrap();
    assert!(full.updated.contains("b"));
    assert!(full.updated.contains("c"));
    assert!(full.removed.contains("a"));
}

#[test]
fn till_is_never_below_since_in_served_summaries() {
    let mut summaries = ChangeSummaries::default();
    summaries.add_changes(10, vec!["a".into()], vec![]);

    for since in [0, 5, 10, 15] {
        if let Ok((_, till)) = summaries.fetch_since(since) {
            assert!(till >= since, "till {till} < since {since}");
        }
    }
}

#[test]
fn flush_and_sync_of_same_kind_exclude_each_other() {
    let gate = OperationGate::new();

    // A user flush takes the gate; the scheduled sync skips.
    assert!(gate.request(OperationKind::Impressions));
    assert!(gate.is_running(OperationKind::Impressions));
    assert!(!gate.request(OperationKind::Impressions));

    // Independent kinds are unaffected, and release reopens the gate.
    assert!(gate.request(OperationKind::Telemetry));
    gate.finish(OperationKind::Impressions);
    assert!(gate.request(OperationKind::Impressions));
}

#[test]
fn endpoint_report_covers_latencies_statuses_and_count() {
    let telemetry = ProxyTelemetry::new(60, 10);
    telemetry.record_at(Endpoint::SplitChanges, 200, 10, 600);
    telemetry.record_at(Endpoint::SplitChanges, 200, 20, 610);
    telemetry.record_at(Endpoint::SplitChanges, 200, 30, 650);

    let report = telemetry.timesliced_report();
    assert_eq!(report.len(), 1);
    let resource = &report[0].resources["splitChanges"];
    assert_eq!(resource.request_count, 3);
    assert_eq!(resource.status_codes[&200], 3);
    for latency in [10, 20, 30] {
        assert!(resource.latencies.contains(&latency));
    }
}

#[test]
fn archived_tombstones_serialize_like_real_splits() {
    let live = split("checkout", 10);
    let tombstone = Split::archived_tombstone("checkout", 20);

    let live_json = serde_json::to_value(&live).unwrap();
    let tombstone_json = serde_json::to_value(&tombstone).unwrap();

    assert_eq!(live_json["status"], "ACTIVE");
    assert_eq!(tombstone_json["status"], "ARCHIVED");
    assert_eq!(tombstone_json["changeNumber"], 20);
    // Same shape either way, so SDKs parse both from one schema.
    assert_eq!(
        live_json.as_object().unwrap().len(),
        tombstone_json.as_object().unwrap().len()
    );
}
