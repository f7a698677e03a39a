//! Retry counter display convention.
//!
//! The retry count lives in its own field on the task. The status message
//! still carries `"Retry: N"` so operators reading raw rows can see retry
//! history, and older rows may only have the message. Both are read back.

const RETRY_PREFIX: &str = "Retry:";

/// Display form written into the status message on requeue.
pub fn format_retry_message(count: u32) -> String {
    format!("{RETRY_PREFIX} {count}")
}

/// Parse `"Retry: N"` out of a status message. Absent or malformed -> 0.
pub fn parse_retry_count(message: Option<&str>) -> u32 {
    let Some(message) = message else {
        return 0;
    };
    let Some(idx) = message.find(RETRY_PREFIX) else {
        return 0;
    };
    message[idx + RETRY_PREFIX.len()..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .unwrap_or(0)
}

/// Retry count used for recovery decisions.
///
/// Legacy records carry the count only in the message, so the larger of the
/// two wins.
pub fn effective_retry_count(field: u32, message: Option<&str>) -> u32 {
    field.max(parse_retry_count(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(None, 0)]
    #[case(Some(""), 0)]
    #[case(Some("Retry: 2"), 2)]
    #[case(Some("Retry:7"), 7)]
    #[case(Some("worker restarted; Retry: 11"), 11)]
    #[case(Some("Retry: many"), 0)]
    #[case(Some("Retry: -1"), 0)]
    fn parses_retry_counter(#[case] message: Option<&str>, #[case] expected: u32) {
        assert_eq!(parse_retry_count(message), expected);
    }

    #[test]
    fn format_and_parse_agree() {
        assert_eq!(parse_retry_count(Some(&format_retry_message(4))), 4);
    }

    #[test]
    fn effective_count_takes_the_larger_value() {
        assert_eq!(effective_retry_count(0, Some("Retry: 2")), 2);
        assert_eq!(effective_retry_count(3, Some("Retry: 1")), 3);
        assert_eq!(effective_retry_count(1, None), 1);
    }
}
