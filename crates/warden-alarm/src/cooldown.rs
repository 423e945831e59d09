//! Cooldown decision between two remediations of the same alarm.

use std::time::Duration;

use warden_state::Event;

/// Whether an alarm must hold off firing.
///
/// - no previous event: fire;
/// - previous event still in flight: wait;
/// - otherwise wait until strictly more than `wait` has passed since it ended.
pub fn should_wait(latest: Option<&Event>, wait: Duration, now_ms: u64) -> bool {
    let Some(event) = latest else {
        return false;
    };
    if event.in_flight() {
        return true;
    }
    let elapsed = now_ms.saturating_sub(event.end_time);
    elapsed <= wait.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_state::{Alarm, SCALE_UP};

    fn alarm() -> Alarm {
        Alarm {
            name: "rush".into(),
            expression: "true".into(),
            enabled: true,
            data_sources: Vec::new(),
            actions: vec![SCALE_UP.into()],
            instance: "api".into(),
            wait_secs: 300,
            envs: Default::default(),
        }
    }

    fn ended_at(end: u64) -> Event {
        let mut event = Event::open(&alarm(), SCALE_UP, end - 1);
        event.finish(end, Ok(()));
        event
    }

    const FIVE_MIN: Duration = Duration::from_secs(300);

    #[test]
    fn no_previous_event_fires() {
        assert!(!should_wait(None, FIVE_MIN, 1_000));
    }

    #[test]
    fn in_flight_event_always_waits() {
        let event = Event::open(&alarm(), SCALE_UP, 1_000);
        assert!(should_wait(Some(&event), FIVE_MIN, 1_000));
        assert!(should_wait(Some(&event), Duration::ZERO, u64::MAX));
    }

    #[test]
    fn boundary_is_exclusive() {
        let event = ended_at(1_000_000);
        // Ended 10 minutes ago, wait is 5 minutes.
        assert!(!should_wait(Some(&event), FIVE_MIN, 1_600_000));
        // Ended 1 minute ago.
        assert!(should_wait(Some(&event), FIVE_MIN, 1_060_000));
        // Exactly the wait period: still waiting.
        assert!(should_wait(Some(&event), FIVE_MIN, 1_300_000));
        assert!(!should_wait(Some(&event), FIVE_MIN, 1_300_001));
    }

    #[test]
    fn clock_skew_waits() {
        let event = ended_at(2_000_000);
        assert!(should_wait(Some(&event), FIVE_MIN, 1_000_000));
    }
}
