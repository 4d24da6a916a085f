//! Text parsing over the fixed `SUCCESS: <payload>` / `FAILED: <reason>`
//! output contract every fabric job emits (spec.md §4.2). The workload's
//! own language is an implementation detail; only these two line shapes
//! matter here.

use std::collections::HashMap;

/// The last `SUCCESS: <payload>` or `FAILED: <reason>` line in the log, if
/// any. Jobs may print diagnostic noise before the final marker line.
pub fn last_marker(log: &str) -> Option<(bool, &str)> {
    log.lines()
        .rev()
        .find_map(|line| {
            if let Some(payload) = line.strip_prefix("SUCCESS:") {
                Some((true, payload.trim()))
            } else {
                line.strip_prefix("FAILED:").map(|reason| (false, reason.trim()))
            }
        })
}

/// Parses `ListConnected` output: one `SUCCESS: <subnqn>, <device_path>`
/// line per matched controller, `FAILED: <subnqn> ...` lines are simply
/// absent from the result (the caller treats "not found" as "not
/// attached", not as an error).
pub fn parse_connected(log: &str) -> HashMap<String, String> {
    let mut result = HashMap::new();
    for line in log.lines() {
        let Some(payload) = line.strip_prefix("SUCCESS:") else {
            continue;
        };
        let Some((sub_nqn, device_path)) = payload.split_once(',') else {
            continue;
        };
        result.insert(sub_nqn.trim().to_string(), device_path.trim().to_string());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_marker_picks_final_line() {
        assert_eq!(
            last_marker("some noise\nSUCCESS: /dev/nvme3n1"),
            Some((true, "/dev/nvme3n1"))
        );
        assert_eq!(
            last_marker("FAILED: disconnected 0 controller(s)"),
            Some((false, "disconnected 0 controller(s)"))
        );
        assert_eq!(last_marker("nothing useful"), None);
    }

    #[test]
    fn parse_connected_collects_matches_only() {
        let log = "SUCCESS: nqn.s0, /dev/nvme0n1\nFAILED: nqn.s1 is not connected to any device\nSUCCESS: nqn.s2, /dev/nvme1n1";
        let parsed = parse_connected(log);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get("nqn.s0").unwrap(), "/dev/nvme0n1");
        assert_eq!(parsed.get("nqn.s2").unwrap(), "/dev/nvme1n1");
        assert!(!parsed.contains_key("nqn.s1"));
    }
}
