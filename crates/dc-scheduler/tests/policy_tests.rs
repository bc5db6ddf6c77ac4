//! Campaign policy tests.
//!
//! All local-time expectations are in the fixed operating zone (UTC+7), so
//! e.g. 02:00 UTC is 09:00 local.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use dc_common::{Campaign, CampaignStatus, Lead, RetryPayload};
use dc_scheduler::policy::{
    build_call_request, build_retry_request, filter_active_campaigns, parse_time_windows,
    within_absolute_window, within_time_of_day,
};

fn campaign(id: &str) -> Campaign {
    Campaign {
        id: id.to_string(),
        tenant_id: "tenant-1".to_string(),
        name: format!("{id}-name"),
        status: CampaignStatus::Running,
        start_time: None,
        end_time: None,
        script_id: Some("script-1".to_string()),
        call_interval: None,
        description: None,
        voice_id: None,
        email: None,
        max_call_time: None,
        time_of_day: None,
        max_callback: None,
        callback_conditions: None,
    }
}

fn lead(id: &str, phone: &str) -> Lead {
    Lead {
        id: id.to_string(),
        phone_number: phone.to_string(),
        name: None,
        tenant_id: Some("tenant-1".to_string()),
        campaign_id: Some("camp-1".to_string()),
    }
}

fn at_utc(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 15, hour, minute, 0).unwrap()
}

fn naive(hour: u32, minute: u32) -> chrono::NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, 15)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

#[test]
fn absolute_window_open_bounds_pass() {
    let c = campaign("camp-1");
    assert!(within_absolute_window(&c, at_utc(0, 0)));
}

#[test]
fn absolute_window_naive_bounds_are_operating_zone_local() {
    let mut c = campaign("camp-1");
    // 09:00 local = 02:00 UTC
    c.start_time = Some(naive(9, 0));

    assert!(!within_absolute_window(&c, at_utc(1, 59)));
    assert!(within_absolute_window(&c, at_utc(2, 0)));
}

#[test]
fn absolute_window_end_is_exclusive() {
    let mut c = campaign("camp-1");
    // 10:00 local = 03:00 UTC
    c.end_time = Some(naive(10, 0));

    assert!(within_absolute_window(&c, at_utc(2, 59)));
    assert!(!within_absolute_window(&c, at_utc(3, 0)));
    assert!(!within_absolute_window(&c, at_utc(4, 0)));
}

#[test]
fn parse_windows_tolerates_bad_data() {
    assert!(parse_time_windows(None).is_empty());
    assert!(parse_time_windows(Some("")).is_empty());
    assert!(parse_time_windows(Some("not json")).is_empty());
    assert!(parse_time_windows(Some("{\"fromHour\":9}")).is_empty());

    let windows =
        parse_time_windows(Some(r#"[{"fromHour":9,"fromMinute":0,"toHour":17,"toMinute":30}, 42]"#));
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].start_minutes(), 9 * 60);
    assert_eq!(windows[0].end_minutes(), 17 * 60 + 30);
}

#[test]
fn parse_windows_accepts_double_encoded_json() {
    let raw = r#""[{\"fromHour\":8,\"fromMinute\":30,\"toHour\":12,\"toMinute\":0}]""#;
    let windows = parse_time_windows(Some(raw));
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].start_minutes(), 8 * 60 + 30);
}

#[test]
fn parse_windows_clamps_out_of_range_values() {
    let windows =
        parse_time_windows(Some(r#"[{"fromHour":-2,"fromMinute":75,"toHour":30,"toMinute":59}]"#));
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].from_hour, 0);
    assert_eq!(windows[0].from_minute, 59);
    assert_eq!(windows[0].to_hour, 23);
    assert_eq!(windows[0].to_minute, 59);
}

#[test]
fn no_windows_means_no_restriction() {
    let mut c = campaign("camp-1");
    assert!(within_time_of_day(&c, at_utc(20, 0)));

    c.time_of_day = Some("garbage".to_string());
    assert!(within_time_of_day(&c, at_utc(20, 0)));
}

#[test]
fn time_of_day_boundaries_are_half_open() {
    let mut c = campaign("camp-1");
    // 09:00–10:00 local = 02:00–03:00 UTC
    c.time_of_day =
        Some(r#"[{"fromHour":9,"fromMinute":0,"toHour":10,"toMinute":0}]"#.to_string());

    assert!(!within_time_of_day(&c, at_utc(1, 59)));
    assert!(within_time_of_day(&c, at_utc(2, 0)));
    assert!(within_time_of_day(&c, at_utc(2, 59)));
    assert!(!within_time_of_day(&c, at_utc(3, 0)));
}

#[test]
fn zero_length_window_never_matches() {
    let mut c = campaign("camp-1");
    c.time_of_day =
        Some(r#"[{"fromHour":9,"fromMinute":0,"toHour":9,"toMinute":0}]"#.to_string());

    // A configured-but-degenerate window keeps the gate closed all day.
    assert!(!within_time_of_day(&c, at_utc(2, 0)));
    assert!(!within_time_of_day(&c, at_utc(12, 0)));
}

#[test]
fn midnight_wrapping_window_is_inactive_on_both_sides() {
    let mut c = campaign("camp-1");
    // 22:00–06:00 local would wrap; wrapping is not supported.
    c.time_of_day =
        Some(r#"[{"fromHour":22,"fromMinute":0,"toHour":6,"toMinute":0}]"#.to_string());

    assert!(!within_time_of_day(&c, at_utc(16, 0))); // 23:00 local
    assert!(!within_time_of_day(&c, at_utc(22, 0))); // 05:00 local
}

#[test]
fn multiple_windows_any_match_passes() {
    let mut c = campaign("camp-1");
    c.time_of_day = Some(
        r#"[{"fromHour":9,"fromMinute":0,"toHour":11,"toMinute":0},
            {"fromHour":14,"fromMinute":0,"toHour":17,"toMinute":0}]"#
            .to_string(),
    );

    assert!(within_time_of_day(&c, at_utc(3, 30))); // 10:30 local
    assert!(!within_time_of_day(&c, at_utc(5, 0))); // 12:00 local
    assert!(within_time_of_day(&c, at_utc(8, 0))); // 15:00 local
}

#[test]
fn filter_applies_both_gates() {
    let open = campaign("camp-open");

    let mut not_started = campaign("camp-later");
    not_started.start_time = Some(naive(20, 0)); // 20:00 local

    let mut off_hours = campaign("camp-night");
    off_hours.time_of_day =
        Some(r#"[{"fromHour":9,"fromMinute":0,"toHour":10,"toMinute":0}]"#.to_string());

    // 12:00 local
    let now = at_utc(5, 0);
    let active = filter_active_campaigns(vec![open, not_started, off_hours], now);
    let ids: Vec<_> = active.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["camp-open"]);
}

#[test]
fn call_request_carries_campaign_defaults() {
    let mut c = campaign("camp-1");
    c.max_callback = Some(5);
    let l = lead("lead-1", "+84900000001");

    let request = build_call_request(&c, &l, at_utc(2, 0), 3, 300);
    assert!(!request.is_retry);
    assert_eq!(request.attempt, 0);
    assert_eq!(request.max_attempts, 5);
    assert_eq!(request.retry_interval, 300);
    assert_eq!(request.lead_name.as_deref(), Some("Lead +84900000001"));

    // Fresh envelope id per emission.
    let again = build_call_request(&c, &l, at_utc(2, 0), 3, 300);
    assert_ne!(request.call_id, again.call_id);

    let without_cap = build_call_request(&campaign("camp-2"), &l, at_utc(2, 0), 3, 300);
    assert_eq!(without_cap.max_attempts, 3);
}

#[test]
fn retry_request_carries_payload_state_under_fresh_id() {
    let c = campaign("camp-1");
    let payload = RetryPayload {
        campaign_id: "camp-1".to_string(),
        lead_id: "lead-1".to_string(),
        phone: "+84900000001".to_string(),
        attempt: 2,
        max_attempts: 3,
        retry_interval_s: 120,
        call_id: "old-call".to_string(),
        last_outcome: Some("BUSY".to_string()),
    };

    let request = build_retry_request(&c, &payload, at_utc(2, 0));
    assert!(request.is_retry);
    assert_eq!(request.original_call_id.as_deref(), Some("old-call"));
    assert_ne!(request.call_id, "old-call");
    assert_eq!(request.attempt, 2);
    assert_eq!(request.max_attempts, 3);
    assert_eq!(request.retry_interval, 120);
    assert_eq!(request.phone_number, "+84900000001");
}
