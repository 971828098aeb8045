//! Advertisement matching for scan-time device selection.

/// Canonical MAC form: lowercase, colon-separated.
pub fn normalize_address(raw: &str) -> String {
    raw.to_ascii_lowercase().replace('-', ":")
}

/// Case-insensitive local-name prefix test.
pub fn name_has_prefix(name: &str, prefix: &str) -> bool {
    name.len() >= prefix.len() && name[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Matches discovered peripherals against an optional exact name and an
/// optional address. Every populated field must match; an empty filter
/// accepts everything.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    name: Option<String>,
    address: Option<String>,
}

impl DeviceFilter {
    pub fn new(name: Option<&str>, address: Option<&str>) -> Self {
        Self {
            name: name.map(str::to_owned),
            address: address.map(normalize_address),
        }
    }

    pub fn matches(&self, local_name: Option<&str>, address: &str) -> bool {
        if let Some(want) = &self.address {
            if normalize_address(address) != *want {
                return false;
            }
        }
        if let Some(want) = &self.name {
            if local_name != Some(want.as_str()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_fields_match() {
        let filter = DeviceFilter::new(Some("Match"), Some("11-11-11-11-11-11"));
        assert!(filter.matches(Some("Match"), "11-11-11-11-11-11"));
    }

    #[test]
    fn test_any_mismatch_rejects() {
        let filter = DeviceFilter::new(Some("Match"), Some("11-11-11-11-11-11"));
        assert!(!filter.matches(Some("Other"), "11-11-11-11-11-11"));
        assert!(!filter.matches(Some("Match"), "22-22-22-22-22-22"));
        assert!(!filter.matches(None, "11-11-11-11-11-11"));
    }

    #[test]
    fn test_empty_filter_accepts_all() {
        let filter = DeviceFilter::default();
        assert!(filter.matches(None, "aa:bb:cc:dd:ee:ff"));
    }

    #[test]
    fn test_address_normalization() {
        let filter = DeviceFilter::new(None, Some("AA-BB-CC-DD-EE-FF"));
        assert!(filter.matches(None, "aa:bb:cc:dd:ee:ff"));
        assert_eq!(normalize_address("AA-BB-CC-DD-EE-FF"), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_name_prefix_case_insensitive() {
        assert!(name_has_prefix("M3i Keiser", "m3"));
        assert!(name_has_prefix("Flywheel 1", "Flywheel"));
        assert!(!name_has_prefix("M", "m3"));
    }
}
