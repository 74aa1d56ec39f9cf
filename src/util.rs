use std::time::Duration;

/// Converts a timeout to whole milliseconds, for the platform poll call.
///
/// Fractions of a millisecond are rounded up, so that a tiny but nonzero timeout does not become a zero timeout (which would make the poll call return immediately).
pub(crate) fn timeout_ms(timeout: Duration) -> u128 {
	let ms = timeout.as_millis();

	if Duration::from_millis(ms as u64) < timeout {
		ms + 1
	}
	else {
		ms
	}
}

#[test]
fn test_timeout_ms() {
	assert_eq!(timeout_ms(Duration::ZERO), 0);
	assert_eq!(timeout_ms(Duration::from_millis(50)), 50);
	assert_eq!(timeout_ms(Duration::from_micros(1)), 1);
	assert_eq!(timeout_ms(Duration::from_micros(1500)), 2);
	assert_eq!(timeout_ms(Duration::from_secs(5)), 5000);
}
