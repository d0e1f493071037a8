//! Argument vectors for open-iscsi's `iscsiadm` and parsing of its session
//! listing.
//!
//! Commands are built here and executed on the host through the relay; this
//! module never runs anything itself.

use crate::types::{DEFAULT_ISCSI_PORT, Portal};

const ISCSIADM: &str = "iscsiadm";

/// A live session as reported by `iscsiadm -m session`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: u32,
    pub portal: Portal,
    pub target_iqn: String,
}

fn argv(args: &[&str]) -> Vec<String> {
    std::iter::once(ISCSIADM)
        .chain(args.iter().copied())
        .map(String::from)
        .collect()
}

/// `iscsiadm -m session`
pub fn list_sessions() -> Vec<String> {
    argv(&["-m", "session"])
}

/// `iscsiadm -m discovery -t sendtargets -p <portal>`
pub fn discover(portal: &Portal) -> Vec<String> {
    argv(&[
        "-m",
        "discovery",
        "-t",
        "sendtargets",
        "-p",
        &portal.to_string(),
    ])
}

/// `iscsiadm -m node -T <iqn> -p <portal> --login`
pub fn login(target_iqn: &str, portal: &Portal) -> Vec<String> {
    argv(&[
        "-m",
        "node",
        "-T",
        target_iqn,
        "-p",
        &portal.to_string(),
        "--login",
    ])
}

/// `iscsiadm -m node -T <iqn> -p <portal> --logout`
pub fn logout(target_iqn: &str, portal: &Portal) -> Vec<String> {
    argv(&[
        "-m",
        "node",
        "-T",
        target_iqn,
        "-p",
        &portal.to_string(),
        "--logout",
    ])
}

/// Parse one session line.
///
/// Format: `tcp: [3] 10.0.0.1:3260,1 iqn.2013-01.com.example:test (non-flash)`,
/// with IPv6 portals bracketed (`[fe80::1]:3260,1`).
fn parse_session_line(line: &str) -> Option<Session> {
    let mut fields = line.split_whitespace();

    let _transport = fields.next()?.strip_suffix(':')?;
    let id = fields
        .next()?
        .strip_prefix('[')?
        .strip_suffix(']')?
        .parse()
        .ok()?;

    // Drop the target portal group tag
    let portal = fields.next()?;
    let portal = portal.rsplit_once(',').map_or(portal, |(p, _tpgt)| p);
    let portal = Portal::parse(portal, DEFAULT_ISCSI_PORT).ok()?;

    let target_iqn = fields.next()?.to_string();

    Some(Session {
        id,
        portal,
        target_iqn,
    })
}

/// Parse `iscsiadm -m session` output, skipping lines that are not sessions.
pub fn parse_sessions(output: &str) -> Vec<Session> {
    output.lines().filter_map(parse_session_line).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_argv() {
        let portal = Portal::new("10.0.0.1", 3260);
        assert_eq!(
            login("iqn.2013-01.com.example:test", &portal),
            vec![
                "iscsiadm",
                "-m",
                "node",
                "-T",
                "iqn.2013-01.com.example:test",
                "-p",
                "10.0.0.1:3260",
                "--login"
            ]
        );
        assert_eq!(
            logout("iqn.x", &Portal::new("fe80::1", 3261)).last().unwrap(),
            "--logout"
        );
        assert_eq!(discover(&Portal::new("fe80::1", 3261))[6], "[fe80::1]:3261");
    }

    #[test]
    fn test_parse_sessions() {
        let output = "\
tcp: [1] 10.0.0.1:3260,1 iqn.2013-01.com.example:test (non-flash)
tcp: [2] 10.0.0.2:3260,1 iqn.2013-01.com.example:test (non-flash)
tcp: [7] [fd00::10]:3261,2 iqn.2013-01.com.example:other (non-flash)
";
        let sessions = parse_sessions(output);
        assert_eq!(sessions.len(), 3);
        assert_eq!(sessions[0].id, 1);
        assert_eq!(sessions[0].portal, Portal::new("10.0.0.1", 3260));
        assert_eq!(sessions[0].target_iqn, "iqn.2013-01.com.example:test");
        assert_eq!(sessions[2].portal, Portal::new("fd00::10", 3261));
        assert_eq!(sessions[2].target_iqn, "iqn.2013-01.com.example:other");
    }

    #[test]
    fn test_parse_sessions_skips_noise() {
        let output = "iscsiadm: No active sessions.\n\ngarbage line\n";
        assert!(parse_sessions(output).is_empty());
    }
}
