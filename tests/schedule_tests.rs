use chrono::{Duration, Utc};

use chime::schedule::Recurrence;

#[test]
fn test_every_interval() {
    let rec = Recurrence::parse("@every 2s").unwrap();
    let now = Utc::now();
    let next = rec.next_after(now).unwrap();
    assert_eq!(next - now, Duration::seconds(2));
}

#[test]
fn test_every_compound_duration() {
    let rec = Recurrence::parse("@every 1m 30s").unwrap();
    let now = Utc::now();
    let next = rec.next_after(now).unwrap();
    assert_eq!(next - now, Duration::seconds(90));
}

#[test]
fn test_every_rejects_garbage() {
    assert!(Recurrence::parse("@every later").is_err());
    assert!(Recurrence::parse("@every ").is_err());
    assert!(Recurrence::parse("@every 0s").is_err());
}

#[test]
fn test_seconds_grained_cron() {
    // Every 2nd second.
    let rec = Recurrence::parse("*/2 * * * * *").unwrap();
    let now = Utc::now();
    let next = rec.next_after(now).unwrap();
    assert!(next > now);
    assert!(next - now <= Duration::seconds(2));
}

#[test]
fn test_cron_with_year_field() {
    let rec = Recurrence::parse("0 0 0 1 1 * 2099").unwrap();
    let next = rec.next_after(Utc::now()).unwrap();
    assert_eq!(next.to_rfc3339(), "2099-01-01T00:00:00+00:00");
}

#[test]
fn test_descriptor_aliases() {
    let now = Utc::now();
    for alias in ["@hourly", "@daily", "@midnight", "@weekly", "@monthly", "@yearly", "@annually"] {
        let rec = Recurrence::parse(alias).unwrap();
        let next = rec.next_after(now).unwrap();
        assert!(next > now, "{alias} must fire in the future");
    }

    let hourly = Recurrence::parse("@hourly").unwrap();
    let next = hourly.next_after(now).unwrap();
    assert!(next - now <= Duration::hours(1));
    assert_eq!(next.timestamp() % 3600, 0);
}

#[test]
fn test_empty_and_invalid_rejected() {
    assert!(Recurrence::parse("").is_err());
    assert!(Recurrence::parse("   ").is_err());
    assert!(Recurrence::parse("not a cron").is_err());
    assert!(Recurrence::parse("@fortnightly").is_err());
}

#[test]
fn test_every_advances_from_reference_instant() {
    let rec = Recurrence::parse("@every 5s").unwrap();
    let reference = Utc::now() + Duration::hours(1);
    let next = rec.next_after(reference).unwrap();
    assert_eq!(next - reference, Duration::seconds(5));
}
