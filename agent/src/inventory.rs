// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Local-filesystem key inventory scan (spec §4.12): `/etc/ssh` host keys
//! and every `authorized_keys`/`id_*.pub` under non-system users' home
//! directories. This is the agent-mode counterpart of `key_scanner` — same
//! rules, but reading the local filesystem directly instead of over SFTP,
//! since the agent already runs on the host it is inventorying.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use chrono::{DateTime, Utc};

const SKIPPED_SHELLS: &[&str] = &["/usr/sbin/nologin", "/sbin/nologin", "/bin/false", "nologin", "false"];
const IDENTITY_KEY_NAMES: &[&str] = &["id_rsa", "id_ed25519", "id_ecdsa", "id_dsa"];
const HOST_KEY_TYPES: &[&str] = &["rsa", "ed25519", "ecdsa", "dsa"];

#[derive(Debug, Clone)]
pub struct LocalKeyRecord {
    pub public_key_data: String,
    pub file_path: String,
    pub file_type: &'static str,
    pub unix_owner: Option<String>,
    pub unix_permissions: Option<u32>,
    pub file_mtime: Option<DateTime<Utc>>,
    pub file_size: Option<u64>,
    pub is_host_key: bool,
}

struct PasswdEntry {
    username: String,
    home: String,
}

fn parse_passwd(contents: &str) -> Vec<PasswdEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 7 {
                return None;
            }
            let username = fields[0];
            let home = fields[5];
            let shell = fields[6];
            if SKIPPED_SHELLS.contains(&shell) || home.starts_with("/dev") {
                return None;
            }
            Some(PasswdEntry {
                username: username.to_string(),
                home: home.to_string(),
            })
        })
        .collect()
}

async fn stat_file(path: &Path) -> Option<(DateTime<Utc>, u64, String)> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    let mtime = DateTime::from_timestamp(meta.mtime(), 0);
    let owner = users_name(meta.uid());
    mtime.map(|m| (m, meta.len(), owner))
}

/// Best-effort numeric-uid-as-owner fallback; a full `/etc/passwd` uid→name
/// join is not worth a second file read here since `unix_owner` is a
/// diagnostic field, not a join key.
fn users_name(uid: u32) -> String {
    uid.to_string()
}

async fn read_key_line(path: &Path, is_host_key: bool, owner: Option<String>) -> Option<LocalKeyRecord> {
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    let line = contents.lines().find(|l| {
        let l = l.trim();
        !l.is_empty() && !l.starts_with('#')
    })?;
    let (mtime, size, stat_owner) = match stat_file(path).await {
        Some((m, s, o)) => (Some(m), Some(s), Some(o)),
        None => (None, None, None),
    };
    Some(LocalKeyRecord {
        public_key_data: line.trim().to_string(),
        file_path: path.display().to_string(),
        file_type: if is_host_key { "host_key" } else { "public_key" },
        unix_owner: owner.or(stat_owner),
        unix_permissions: None,
        file_mtime: mtime,
        file_size: size,
        is_host_key,
    })
}

async fn read_authorized_keys(path: &Path, owner: &str) -> Vec<LocalKeyRecord> {
    let Ok(contents) = tokio::fs::read_to_string(path).await else {
        return Vec::new();
    };
    let (mtime, size, _) = match stat_file(path).await {
        Some(t) => t,
        None => (None, None, String::new()),
    };
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| LocalKeyRecord {
            public_key_data: l.to_string(),
            file_path: path.display().to_string(),
            file_type: "authorized_keys",
            unix_owner: Some(owner.to_string()),
            unix_permissions: None,
            file_mtime: mtime,
            file_size: size,
            is_host_key: false,
        })
        .collect()
}

/// Scan the local host for every discoverable public key. Individual
/// unreadable files are skipped, never fatal — matching `key_scanner`'s
/// propagation policy.
pub async fn scan_local_host() -> Vec<LocalKeyRecord> {
    let mut keys = Vec::new();

    let Ok(passwd) = tokio::fs::read_to_string("/etc/passwd").await else {
        return keys;
    };
    let users = parse_passwd(&passwd);

    for user in &users {
        let authorized = Path::new(&user.home).join(".ssh/authorized_keys");
        keys.extend(read_authorized_keys(&authorized, &user.username).await);
        let authorized2 = Path::new(&user.home).join(".ssh/authorized_keys2");
        keys.extend(read_authorized_keys(&authorized2, &user.username).await);

        for name in IDENTITY_KEY_NAMES {
            let pub_path = Path::new(&user.home).join(".ssh").join(format!("{name}.pub"));
            if let Some(record) = read_key_line(&pub_path, false, Some(user.username.clone())).await {
                keys.push(record);
            }
        }
    }

    for key_type in HOST_KEY_TYPES {
        let path = Path::new("/etc/ssh").join(format!("ssh_host_{key_type}_key.pub"));
        if let Some(record) = read_key_line(&path, true, Some("root".to_string())).await {
            keys.push(record);
        }
    }

    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_passwd_skips_system_accounts() {
        let contents = "\
root:x:0:0:root:/root:/bin/bash
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
alice:x:1000:1000:Alice:/home/alice:/bin/bash
";
        let users = parse_passwd(contents);
        let names: Vec<&str> = users.iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, vec!["root", "alice"]);
    }

    #[tokio::test]
    async fn read_authorized_keys_skips_comments_and_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        tokio::fs::write(
            &path,
            "# a comment\n\nssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIJ5lUIu0pGPM5ITaGDUUTMmCP89YZrLNyGzWxZ1n3Wnd alice@ws\n",
        )
        .await
        .unwrap();

        let records = read_authorized_keys(&path, "alice").await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file_type, "authorized_keys");
        assert_eq!(records[0].unix_owner.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn read_authorized_keys_missing_file_returns_empty() {
        let records = read_authorized_keys(Path::new("/nonexistent/authorized_keys"), "bob").await;
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn scan_local_host_finds_no_users_when_passwd_missing() {
        // Can't easily redirect /etc/passwd in a unit test; exercise the
        // passwd-missing branch directly instead via a nonexistent path
        // through parse logic already covered above. This test documents
        // that scan_local_host degrades to an empty vec rather than
        // panicking when run in a minimal container without /etc/passwd
        // readable (the common case in a sandboxed test runner).
        let keys = scan_local_host().await;
        let _ = keys; // either empty or the real host's keys; must not panic
    }
}
