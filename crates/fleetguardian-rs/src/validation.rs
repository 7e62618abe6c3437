use uuid::Uuid;

/// Scanner preferences the coordinator recognizes. Anything else in a scan
/// request is rejected rather than silently carried along.
pub const RECOGNIZED_SCANNER_PREFERENCES: &[&str] = &[
    "max_checks",
    "max_hosts",
    "checks_timeout",
    "plugins_timeout",
    "optimize_test",
    "non_simult_ports",
    "report_host_details",
    "table_driven_lsc",
];

pub fn is_recognized_preference(key: &str) -> bool {
    RECOGNIZED_SCANNER_PREFERENCES.contains(&key)
}

/// Dotted-decimal NVT object identifier, e.g. `1.3.6.1.4.1.25623.1.0.10662`.
pub fn is_valid_oid(oid: &str) -> bool {
    if oid.is_empty() {
        return false;
    }
    let mut segments = 0usize;
    for segment in oid.split('.') {
        if segment.is_empty() || segment.parse::<u64>().is_err() {
            return false;
        }
        segments += 1;
    }
    segments >= 2
}

pub fn parse_agent_uuid(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw).ok()
}

pub fn is_valid_severity(severity: f64) -> bool {
    (0.0..=10.0).contains(&severity) && severity.is_finite()
}

pub fn is_valid_qod(qod: i64) -> bool {
    (0..=100).contains(&qod)
}

/// Port descriptor on a submitted result: `22`, `22/tcp`, or the OpenVAS
/// convention `general/tcp` for host-wide findings. Empty is allowed (the
/// finding is not port-bound).
pub fn is_valid_result_port(port: &str) -> bool {
    if port.is_empty() {
        return true;
    }
    let (num, proto) = match port.split_once('/') {
        Some((n, p)) => (n, Some(p)),
        None => (port, None),
    };
    if let Some(proto) = proto {
        if proto != "tcp" && proto != "udp" {
            return false;
        }
    }
    num == "general" || matches!(num.parse::<u32>(), Ok(n) if (1..=65535).contains(&n))
}

/// Target port specification: comma-separated single ports and inclusive
/// ranges, e.g. `22`, `1-1024`, `22,80,8000-8100`.
pub fn is_valid_port_spec(spec: &str) -> bool {
    if spec.is_empty() {
        return false;
    }
    spec.split(',').all(|item| {
        let item = item.trim();
        match item.split_once('-') {
            Some((lo, hi)) => match (lo.parse::<u32>(), hi.parse::<u32>()) {
                (Ok(lo), Ok(hi)) => (1..=65535).contains(&lo) && (1..=65535).contains(&hi) && lo <= hi,
                _ => false,
            },
            None => matches!(item.parse::<u32>(), Ok(n) if (1..=65535).contains(&n)),
        }
    })
}

/// Pagination window from a `range=a-b` query parameter (inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultRange {
    pub start: i64,
    pub limit: i64,
}

pub fn parse_result_range(raw: &str) -> Option<ResultRange> {
    let (start, end) = raw.split_once('-')?;
    let start: i64 = start.parse().ok()?;
    let end: i64 = end.parse().ok()?;
    if start < 0 || end < start {
        return None;
    }
    Some(ResultRange {
        start,
        limit: end - start + 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oid_accepts_dotted_decimal() {
        assert!(is_valid_oid("1.3.6.1.4.1.25623.1.0.10662"));
        assert!(is_valid_oid("1.2"));
    }

    #[test]
    fn oid_rejects_garbage() {
        assert!(!is_valid_oid("1.2.3.bad"));
        assert!(!is_valid_oid(""));
        assert!(!is_valid_oid("1"));
        assert!(!is_valid_oid("1..2"));
        assert!(!is_valid_oid(".1.2"));
    }

    #[test]
    fn severity_bounds_are_inclusive() {
        assert!(is_valid_severity(0.0));
        assert!(is_valid_severity(10.0));
        assert!(is_valid_severity(5.0));
        assert!(!is_valid_severity(10.1));
        assert!(!is_valid_severity(-0.1));
        assert!(!is_valid_severity(f64::NAN));
    }

    #[test]
    fn result_ports() {
        assert!(is_valid_result_port("22"));
        assert!(is_valid_result_port("22/tcp"));
        assert!(is_valid_result_port("general/udp"));
        assert!(is_valid_result_port(""));
        assert!(!is_valid_result_port("22/icmp"));
        assert!(!is_valid_result_port("0"));
        assert!(!is_valid_result_port("70000/tcp"));
    }

    #[test]
    fn port_specs() {
        assert!(is_valid_port_spec("1-65535"));
        assert!(is_valid_port_spec("22,80,8000-8100"));
        assert!(!is_valid_port_spec("0-10"));
        assert!(!is_valid_port_spec("80-22"));
        assert!(!is_valid_port_spec(""));
        assert!(!is_valid_port_spec("http"));
    }

    #[test]
    fn range_parses_inclusive_window() {
        assert_eq!(
            parse_result_range("0-99"),
            Some(ResultRange { start: 0, limit: 100 })
        );
        assert_eq!(
            parse_result_range("10-10"),
            Some(ResultRange { start: 10, limit: 1 })
        );
        assert_eq!(parse_result_range("5-4"), None);
        assert_eq!(parse_result_range("-1-4"), None);
        assert_eq!(parse_result_range("abc"), None);
    }

    #[test]
    fn preference_catalog_lookup() {
        assert!(is_recognized_preference("max_checks"));
        assert!(!is_recognized_preference("totally_made_up"));
    }
}
