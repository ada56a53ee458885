// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parses sshd/sudo log lines (and journald JSON records) into `AuthEvent`s.
//!
//! Patterns are compiled once at process start, matching the metrics
//! registry idiom used elsewhere in this crate. Every parse function is
//! pure: a bad line returns `None`, it never panics and never logs — the
//! caller decides whether a parse miss is worth a `debug!`.

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;

use crate::models::{AuthMethod, EventType};

/// Days a parsed timestamp may lag `last_timestamp` before we conclude the
/// syslog year guess rolled over (§4.2's year-rollover heuristic).
const YEAR_ROLLOVER_THRESHOLD_DAYS: i64 = 300;

#[derive(Debug, Clone, PartialEq)]
pub struct AuthEvent {
    pub timestamp: DateTime<Utc>,
    pub source_ip: String,
    pub username: String,
    pub auth_method: Option<AuthMethod>,
    pub event_type: EventType,
    pub fingerprint: Option<String>,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub raw_line: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SudoEventLine {
    pub timestamp: DateTime<Utc>,
    pub username: String,
    pub target_user: Option<String>,
    pub tty: Option<String>,
    pub working_dir: Option<String>,
    pub command: Option<String>,
    pub success: bool,
    pub raw_line: String,
}

lazy_static! {
    // "Jan  5 14:23:01 web01 sshd[12345]: "
    static ref SYSLOG_PREFIX: Regex = Regex::new(
        r"^(?P<mon>[A-Z][a-z]{2})\s+(?P<day>\d{1,2})\s+(?P<time>\d{2}:\d{2}:\d{2})\s+\S+\s+(?P<tag>\S+?)(\[(?P<pid>\d+)\])?:\s*(?P<rest>.*)$"
    ).unwrap();

    static ref FINGERPRINT_TAIL: Regex =
        Regex::new(r"ssh2:\s*(?P<alg>\S+)\s+(?P<fp>SHA256:\S+|MD5:\S+|[0-9a-f:]+)\s*$").unwrap();

    // Linux shape 1: accepted
    static ref LINUX_ACCEPTED: Regex = Regex::new(
        r"^Accepted (?P<method>publickey|password|keyboard-interactive) for (?P<user>\S+) from (?P<ip>\S+) port (?P<port>\d+)(?:\s+ssh2.*)?$"
    ).unwrap();

    // Linux shape 2: failed (including "for invalid user X")
    static ref LINUX_FAILED: Regex = Regex::new(
        r"^Failed (?P<method>publickey|password|keyboard-interactive) for (invalid user )?(?P<user>\S+) from (?P<ip>\S+) port (?P<port>\d+)(?:\s+ssh2.*)?$"
    ).unwrap();

    // Linux shape 3: invalid user, no failed-method verb
    static ref LINUX_INVALID_USER: Regex = Regex::new(
        r"^Invalid user (?P<user>\S+) from (?P<ip>\S+)(?: port (?P<port>\d+))?$"
    ).unwrap();

    // Linux shape 4: disconnect
    static ref LINUX_DISCONNECTED: Regex = Regex::new(
        r"^Disconnected from (?:(?:authenticating|invalid) user (?P<user>\S+) )?(?P<ip>\S+) port (?P<port>\d+)(?:.*)?$"
    ).unwrap();

    // Linux shape 5: connection closed (older OpenSSH phrasing of the same event)
    static ref LINUX_CONNECTION_CLOSED: Regex = Regex::new(
        r"^Connection closed by (?:(?:authenticating|invalid) user (?P<user>\S+) )?(?P<ip>\S+) port (?P<port>\d+)(?:.*)?$"
    ).unwrap();

    // AIX shape 1: accepted, no "ssh2" suffix
    static ref AIX_ACCEPTED: Regex = Regex::new(
        r"^Accepted (?P<method>publickey|password|keyboard-interactive) for (?P<user>\S+) from (?P<ip>\S+) port (?P<port>\d+)\.?$"
    ).unwrap();

    // AIX shape 2: failed, no "ssh2" suffix
    static ref AIX_FAILED: Regex = Regex::new(
        r"^Failed (?P<method>publickey|password|keyboard-interactive) for (?P<user>\S+) from (?P<ip>\S+) port (?P<port>\d+)\.?$"
    ).unwrap();

    // sudo: "alice : TTY=pts/0 ; PWD=/home/alice ; USER=root ; COMMAND=/bin/ls"
    static ref SUDO_LINE: Regex = Regex::new(
        r"^(?P<user>\S+)\s*:\s*(?P<body>.*COMMAND=.*)$"
    ).unwrap();
    static ref SUDO_TTY: Regex = Regex::new(r"TTY=(?P<tty>\S+)").unwrap();
    static ref SUDO_PWD: Regex = Regex::new(r"PWD=(?P<pwd>\S+)").unwrap();
    static ref SUDO_TARGET_USER: Regex = Regex::new(r"USER=(?P<target>\S+)").unwrap();
    static ref SUDO_COMMAND: Regex = Regex::new(r"COMMAND=(?P<cmd>.*)$").unwrap();
}

/// Parse one raw log line against every recognized shape in turn. `os_type`
/// picks which accepted/failed pair is tried first (both are tried as a
/// fallback since mixed fleets sometimes forward AIX lines through a Linux
/// syslog relay and vice versa).
pub fn parse_line(
    line: &str,
    os_type: crate::models::OsType,
    reference_time: DateTime<Utc>,
    last_timestamp: Option<DateTime<Utc>>,
) -> Option<AuthEvent> {
    let caps = SYSLOG_PREFIX.captures(line)?;
    let rest = caps.name("rest")?.as_str();
    let pid = caps
        .name("pid")
        .and_then(|m| m.as_str().parse::<u32>().ok());
    let timestamp = parse_syslog_timestamp(&caps, reference_time, last_timestamp)?;

    let fingerprint = FINGERPRINT_TAIL
        .captures(rest)
        .and_then(|c| c.name("fp").map(|m| m.as_str().to_string()));

    let (primary_accepted, primary_failed) = match os_type {
        crate::models::OsType::Linux => (&*LINUX_ACCEPTED, &*LINUX_FAILED),
        crate::models::OsType::Aix => (&*AIX_ACCEPTED, &*AIX_FAILED),
    };

    if let Some(c) = primary_accepted
        .captures(rest)
        .or_else(|| LINUX_ACCEPTED.captures(rest))
        .or_else(|| AIX_ACCEPTED.captures(rest))
    {
        return Some(build_event(
            &c,
            EventType::Accepted,
            timestamp,
            pid,
            fingerprint,
            line,
        ));
    }

    if let Some(c) = primary_failed
        .captures(rest)
        .or_else(|| LINUX_FAILED.captures(rest))
        .or_else(|| AIX_FAILED.captures(rest))
    {
        return Some(build_event(
            &c,
            EventType::Failed,
            timestamp,
            pid,
            fingerprint,
            line,
        ));
    }

    if let Some(c) = LINUX_INVALID_USER.captures(rest) {
        return Some(build_event(
            &c,
            EventType::InvalidUser,
            timestamp,
            pid,
            fingerprint,
            line,
        ));
    }

    if let Some(c) = LINUX_DISCONNECTED
        .captures(rest)
        .or_else(|| LINUX_CONNECTION_CLOSED.captures(rest))
    {
        return Some(build_event(
            &c,
            EventType::Disconnected,
            timestamp,
            pid,
            fingerprint,
            line,
        ));
    }

    None
}

fn build_event(
    c: &regex::Captures,
    event_type: EventType,
    timestamp: DateTime<Utc>,
    pid: Option<u32>,
    fingerprint: Option<String>,
    raw_line: &str,
) -> AuthEvent {
    let username = c
        .name("user")
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();
    let source_ip = c
        .name("ip")
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();
    let port = c.name("port").and_then(|m| m.as_str().parse::<u16>().ok());
    let auth_method = c.name("method").and_then(|m| match m.as_str() {
        "publickey" => Some(AuthMethod::PublicKey),
        "password" => Some(AuthMethod::Password),
        "keyboard-interactive" => Some(AuthMethod::KeyboardInteractive),
        _ => None,
    });

    AuthEvent {
        timestamp,
        source_ip,
        username,
        auth_method,
        event_type,
        fingerprint,
        port,
        pid,
        raw_line: raw_line.to_string(),
    }
}

fn parse_syslog_timestamp(
    caps: &regex::Captures,
    reference_time: DateTime<Utc>,
    last_timestamp: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    let mon = caps.name("mon")?.as_str();
    let day = caps.name("day")?.as_str();
    let time = caps.name("time")?.as_str();

    let mut year = reference_time.year();
    let candidate = format!("{} {:>2} {} {}", mon, day, year, time);
    let naive = NaiveDateTime::parse_from_str(&candidate, "%b %e %Y %H:%M:%S").ok()?;
    let mut parsed = Utc.from_utc_datetime(&naive);

    if let Some(last) = last_timestamp {
        if (last - parsed).num_days() > YEAR_ROLLOVER_THRESHOLD_DAYS {
            year -= 1;
            let candidate = format!("{} {:>2} {} {}", mon, day, year, time);
            let naive = NaiveDateTime::parse_from_str(&candidate, "%b %e %Y %H:%M:%S").ok()?;
            parsed = Utc.from_utc_datetime(&naive);
        }
    }

    Some(parsed)
}

/// Parse a journald JSON record whose `SYSLOG_IDENTIFIER` contains `sshd`.
/// The timestamp here is authoritative (`__REALTIME_TIMESTAMP`, in
/// microseconds since the epoch) so no year-rollover guessing applies.
pub fn parse_journald_json(raw: &str) -> Option<AuthEvent> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let identifier = value.get("SYSLOG_IDENTIFIER")?.as_str()?;
    if !identifier.contains("sshd") {
        return None;
    }
    let message = value.get("MESSAGE")?.as_str()?;
    let ts_field = value.get("__REALTIME_TIMESTAMP")?;
    let micros: i64 = match ts_field.as_str() {
        Some(s) => s.parse().ok()?,
        None => ts_field.as_i64()?,
    };
    let timestamp = DateTime::from_timestamp_micros(micros)?;

    let os_type = crate::models::OsType::Linux;
    let synthetic = format!("Jan  1 00:00:00 host sshd[0]: {}", message);
    let mut event = parse_line(&synthetic, os_type, timestamp, None)?;
    event.timestamp = timestamp;
    event.raw_line = raw.to_string();
    Some(event)
}

pub fn parse_sudo_line(line: &str, reference_time: DateTime<Utc>) -> Option<SudoEventLine> {
    let caps = SYSLOG_PREFIX.captures(line)?;
    let rest = caps.name("rest")?.as_str();
    let timestamp = parse_syslog_timestamp(&caps, reference_time, None)?;

    let sudo_caps = SUDO_LINE.captures(rest)?;
    let username = sudo_caps.name("user")?.as_str().to_string();
    let body = sudo_caps.name("body")?.as_str();

    let tty = SUDO_TTY.captures(body).map(|c| c["tty"].to_string());
    let working_dir = SUDO_PWD.captures(body).map(|c| c["pwd"].to_string());
    let target_user = SUDO_TARGET_USER.captures(body).map(|c| c["target"].to_string());
    let command = SUDO_COMMAND.captures(body).map(|c| c["cmd"].trim().to_string());
    let success = !body.contains("command not allowed") && !body.contains("authentication failure");

    Some(SudoEventLine {
        timestamp,
        username,
        target_user,
        tty,
        working_dir,
        command,
        success,
        raw_line: line.to_string(),
    })
}

/// Sequentially parse a batch of lines, threading `last_timestamp` forward
/// so consecutive entries across a year boundary parse monotonically.
pub fn parse_log(
    lines: &[&str],
    os_type: crate::models::OsType,
    reference_time: DateTime<Utc>,
) -> Vec<AuthEvent> {
    let mut events = Vec::new();
    let mut last_timestamp: Option<DateTime<Utc>> = None;
    for line in lines {
        if let Some(event) = parse_line(line, os_type, reference_time, last_timestamp) {
            last_timestamp = Some(event.timestamp);
            events.push(event);
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OsType;

    fn ref_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 26, 0, 0, 0).unwrap()
    }

    #[test]
    fn s1_accepted_publickey_with_fingerprint() {
        let line = "Jan  5 14:23:01 web01 sshd[12345]: Accepted publickey for root from 10.0.1.50 port 52222 ssh2: RSA SHA256:abc123def456";
        let event = parse_line(line, OsType::Linux, ref_time(), None).unwrap();
        assert_eq!(event.event_type, EventType::Accepted);
        assert_eq!(event.auth_method, Some(AuthMethod::PublicKey));
        assert_eq!(event.username, "root");
        assert_eq!(event.source_ip, "10.0.1.50");
        assert_eq!(event.port, Some(52222));
        assert_eq!(event.pid, Some(12345));
        assert_eq!(event.fingerprint.as_deref(), Some("SHA256:abc123def456"));
    }

    #[test]
    fn failed_password_for_invalid_user() {
        let line = "Jan  5 14:23:01 web01 sshd[1]: Failed password for invalid user bob from 203.0.113.9 port 4444 ssh2";
        let event = parse_line(line, OsType::Linux, ref_time(), None).unwrap();
        assert_eq!(event.event_type, EventType::Failed);
        assert_eq!(event.username, "bob");
    }

    #[test]
    fn disconnected_line() {
        let line = "Jan  5 14:23:01 web01 sshd[1]: Disconnected from authenticating user root 10.0.1.50 port 1234 [preauth]";
        let event = parse_line(line, OsType::Linux, ref_time(), None).unwrap();
        assert_eq!(event.event_type, EventType::Disconnected);
        assert_eq!(event.source_ip, "10.0.1.50");
    }

    #[test]
    fn aix_accepted_without_ssh2_suffix() {
        let line = "Jan  5 14:23:01 aixhost sshd[99]: Accepted password for alice from 192.168.1.2 port 22.";
        let event = parse_line(line, OsType::Aix, ref_time(), None).unwrap();
        assert_eq!(event.event_type, EventType::Accepted);
        assert_eq!(event.username, "alice");
    }

    #[test]
    fn year_rollover_decrements_year() {
        let last = Utc.with_ymd_and_hms(2026, 12, 30, 23, 0, 0).unwrap();
        let line = "Jan  1 00:05:00 web01 sshd[1]: Accepted password for root from 1.2.3.4 port 22 ssh2";
        let event = parse_line(line, OsType::Linux, last, Some(last)).unwrap();
        assert_eq!(event.timestamp.year(), 2025);
    }

    #[test]
    fn sequential_parse_threads_timestamp_across_year_boundary() {
        let lines = vec![
            "Dec 30 23:00:00 web01 sshd[1]: Accepted password for root from 1.2.3.4 port 22 ssh2",
            "Jan  1 00:05:00 web01 sshd[2]: Accepted password for root from 1.2.3.4 port 22 ssh2",
        ];
        let events = parse_log(&lines, OsType::Linux, ref_time());
        assert_eq!(events.len(), 2);
        assert!(events[1].timestamp > events[0].timestamp);
    }

    #[test]
    fn sudo_line_parses_command_and_target_user() {
        let line = "Jan  5 14:23:01 web01 sudo: alice : TTY=pts/0 ; PWD=/home/alice ; USER=root ; COMMAND=/bin/systemctl restart nginx";
        let parsed = parse_sudo_line(line, ref_time()).unwrap();
        assert_eq!(parsed.username, "alice");
        assert_eq!(parsed.target_user.as_deref(), Some("root"));
        assert_eq!(parsed.tty.as_deref(), Some("pts/0"));
        assert_eq!(parsed.command.as_deref(), Some("/bin/systemctl restart nginx"));
        assert!(parsed.success);
    }

    #[test]
    fn garbage_line_returns_none() {
        assert!(parse_line("not a syslog line", OsType::Linux, ref_time(), None).is_none());
    }
}
