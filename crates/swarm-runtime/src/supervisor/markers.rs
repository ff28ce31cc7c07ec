//! Permanent-failure detection from local worker stderr.
//!
//! Some launch failures will never succeed on retry: the package does
//! not exist, the binary is missing, the registry rejected the name.
//! When the stderr tail carries one of these markers the instance goes
//! straight to ERROR and no reconnect is scheduled.

/// Case-insensitive substrings that mark a failure as permanent.
pub const PERMANENT_FAILURE_MARKERS: [&str; 5] = [
    "e404",
    "not found",
    "enoent",
    "command not found",
    "not in this registry",
];

/// Whether any stderr line carries a permanent-failure marker.
#[must_use]
pub fn has_permanent_failure_marker(tail: &[String]) -> bool {
    tail.iter().any(|line| {
        let lower = line.to_lowercase();
        PERMANENT_FAILURE_MARKERS
            .iter()
            .any(|marker| lower.contains(marker))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn detects_npm_e404() {
        assert!(has_permanent_failure_marker(&lines(&[
            "npm ERR! code E404",
            "npm ERR! 404 Not Found - GET https://registry.npmjs.org/nope",
        ])));
    }

    #[test]
    fn detects_enoent_case_insensitively() {
        assert!(has_permanent_failure_marker(&lines(&["spawn ENOENT"])));
        assert!(has_permanent_failure_marker(&lines(&["spawn enoent"])));
    }

    #[test]
    fn detects_shell_command_not_found() {
        assert!(has_permanent_failure_marker(&lines(&[
            "sh: 1: some-launcher: command not found"
        ])));
    }

    #[test]
    fn detects_registry_rejection() {
        assert!(has_permanent_failure_marker(&lines(&[
            "'@scope/worker' is not in this registry."
        ])));
    }

    #[test]
    fn transient_output_is_not_permanent() {
        assert!(!has_permanent_failure_marker(&lines(&[
            "connection reset by peer",
            "worker exited with code 1",
        ])));
        assert!(!has_permanent_failure_marker(&[]));
    }
}
