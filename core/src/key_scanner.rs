// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Enumerates SSH keys reachable from a single host: per-user
//! `authorized_keys`/`authorized_keys2`, `id_*.pub` identities, and the
//! host's own `ssh_host_*_key.pub` files.
//!
//! Every private key's metadata is read from its adjacent `.pub` file only
//! — the private key itself is never opened.

use chrono::{DateTime, Utc};
use russh_sftp::client::SftpSession;

use crate::fingerprint::{self, ParsedKey};

const SKIPPED_SHELLS: &[&str] = &["/usr/sbin/nologin", "/sbin/nologin", "/bin/false", "nologin", "false"];
const IDENTITY_KEY_NAMES: &[&str] = &["id_rsa", "id_ed25519", "id_ecdsa", "id_dsa"];
const HOST_KEY_TYPES: &[&str] = &["rsa", "ed25519", "ecdsa", "dsa"];

#[derive(Debug, Clone)]
pub struct DiscoveredKey {
    pub parsed: ParsedKey,
    pub fingerprint_sha256: String,
    pub fingerprint_md5: Option<String>,
    pub username: Option<String>,
    pub file_path: String,
    pub is_host_key: bool,
    /// Set when this record describes the identity *private* key file
    /// (read by stat only, never opened) rather than the `.pub` it was
    /// fingerprinted from.
    pub is_private_key_metadata: bool,
    pub file_mtime: Option<DateTime<Utc>>,
    pub file_size: Option<u64>,
    pub unix_owner: Option<String>,
    pub unix_permissions: Option<u32>,
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

/// Strip authorized_keys option prefixes (`command="...",no-pty ssh-rsa
/// AAAA... comment`) down to the key-type token onward. Lines that never
/// reach a recognized key-type token are left as-is and will fail to parse
/// as a key further down the pipeline, which is the correct outcome.
fn strip_authorized_keys_options(line: &str) -> &str {
    const KEY_TYPE_PREFIXES: &[&str] = &[
        "ssh-rsa",
        "ssh-dss",
        "ssh-ed25519",
        "ecdsa-sha2-nistp256",
        "ecdsa-sha2-nistp384",
        "ecdsa-sha2-nistp521",
    ];
    for prefix in KEY_TYPE_PREFIXES {
        if let Some(idx) = line.find(prefix) {
            return &line[idx..];
        }
    }
    line
}

fn parse_authorized_keys_file(contents: &str) -> Vec<ParsedKey> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| fingerprint::parse_public_key(strip_authorized_keys_options(line)))
        .collect()
}

fn to_discovered(
    parsed: ParsedKey,
    username: Option<String>,
    file_path: String,
    is_host_key: bool,
    file_mtime: Option<DateTime<Utc>>,
    file_size: Option<u64>,
    unix_owner: Option<String>,
    unix_permissions: Option<u32>,
) -> Option<DiscoveredKey> {
    let fingerprint_sha256 = fingerprint::sha256_fingerprint(&parsed.key_bytes);
    let fingerprint_md5 = Some(fingerprint::md5_fingerprint(&parsed.key_bytes));
    if fingerprint_sha256.is_empty() {
        return None;
    }
    Some(DiscoveredKey {
        parsed,
        fingerprint_sha256,
        fingerprint_md5,
        username,
        file_path,
        is_host_key,
        is_private_key_metadata: false,
        file_mtime,
        file_size,
        unix_owner,
        unix_permissions,
    })
}

/// Scan a single host over an already-open SFTP session, producing every
/// discoverable key. Individual unreadable files are skipped, not fatal.
pub async fn scan_host(sftp: &SftpSession) -> Vec<DiscoveredKey> {
    let mut keys = Vec::new();

    let Some(passwd) = crate::sftp::read(sftp, "/etc/passwd", 4 * 1024 * 1024).await else {
        return keys;
    };
    let users = parse_passwd(&passwd);

    let sshd_config_override = read_authorized_keys_file_override(sftp).await;

    for user in &users {
        let candidate_paths = authorized_keys_paths(&user.home, sshd_config_override.as_deref(), &user.username);
        for path in candidate_paths {
            if let Some(contents) = crate::sftp::read(sftp, &path, 1024 * 1024).await {
                let stat = crate::sftp::stat(sftp, &path).await;
                for parsed in parse_authorized_keys_file(&contents) {
                    if let Some(key) = to_discovered(
                        parsed,
                        Some(user.username.clone()),
                        path.clone(),
                        false,
                        stat.as_ref().and_then(|s| s.mtime),
                        stat.as_ref().map(|s| s.size),
                        Some(user.username.clone()),
                        stat.as_ref().and_then(|s| s.octal_perms),
                    ) {
                        keys.push(key);
                    }
                }
            }
        }

        for name in IDENTITY_KEY_NAMES {
            let pub_path = format!("{}/.ssh/{}.pub", user.home, name);
            if let Some(contents) = crate::sftp::read(sftp, &pub_path, 16 * 1024).await {
                if let Some(parsed) = fingerprint::parse_public_key(contents.trim()) {
                    let stat = crate::sftp::stat(sftp, &pub_path).await;
                    let fingerprint_sha256 = fingerprint::sha256_fingerprint(&parsed.key_bytes);
                    let fingerprint_md5 = Some(fingerprint::md5_fingerprint(&parsed.key_bytes));

                    let private_path = format!("{}/.ssh/{}", user.home, name);
                    if let Some(private_stat) = crate::sftp::stat(sftp, &private_path).await {
                        keys.push(DiscoveredKey {
                            parsed: parsed.clone(),
                            fingerprint_sha256: fingerprint_sha256.clone(),
                            fingerprint_md5: fingerprint_md5.clone(),
                            username: Some(user.username.clone()),
                            file_path: private_path,
                            is_host_key: false,
                            is_private_key_metadata: true,
                            file_mtime: private_stat.mtime,
                            file_size: Some(private_stat.size),
                            unix_owner: Some(user.username.clone()),
                            unix_permissions: private_stat.octal_perms,
                        });
                    }

                    if let Some(key) = to_discovered(
                        parsed,
                        Some(user.username.clone()),
                        pub_path,
                        false,
                        stat.as_ref().and_then(|s| s.mtime),
                        stat.as_ref().map(|s| s.size),
                        Some(user.username.clone()),
                        stat.as_ref().and_then(|s| s.octal_perms),
                    ) {
                        keys.push(key);
                    }
                }
            }
        }
    }

    for key_type in HOST_KEY_TYPES {
        let path = format!("/etc/ssh/ssh_host_{}_key.pub", key_type);
        if let Some(contents) = crate::sftp::read(sftp, &path, 16 * 1024).await {
            if let Some(parsed) = fingerprint::parse_public_key(contents.trim()) {
                let stat = crate::sftp::stat(sftp, &path).await;
                if let Some(key) = to_discovered(
                    parsed,
                    None,
                    path,
                    true,
                    stat.as_ref().and_then(|s| s.mtime),
                    stat.as_ref().map(|s| s.size),
                    Some("root".to_string()),
                    stat.as_ref().and_then(|s| s.octal_perms),
                ) {
                    keys.push(key);
                }
            }
        }
    }

    keys
}

/// `sshd_config`'s `AuthorizedKeysFile` directive, when present, overrides
/// the default `~/.ssh/authorized_keys{,2}` search — a detail present in
/// the original tool that the distilled spec didn't carry forward
/// explicitly. `%h` and `%u` tokens are substituted per `sshd_config(5)`.
async fn read_authorized_keys_file_override(sftp: &SftpSession) -> Option<Vec<String>> {
    let contents = crate::sftp::read(sftp, "/etc/ssh/sshd_config", 256 * 1024).await?;
    for line in contents.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("AuthorizedKeysFile") {
            let templates: Vec<String> = rest.split_whitespace().map(str::to_string).collect();
            if !templates.is_empty() {
                return Some(templates);
            }
        }
    }
    None
}

fn authorized_keys_paths(home: &str, overrides: Option<&[String]>, username: &str) -> Vec<String> {
    match overrides {
        Some(templates) => templates
            .iter()
            .map(|t| {
                let expanded = t.replace("%h", home).replace("%u", username);
                if expanded.starts_with('/') {
                    expanded
                } else {
                    format!("{}/{}", home, expanded)
                }
            })
            .collect(),
        None => vec![
            format!("{}/.ssh/authorized_keys", home),
            format!("{}/.ssh/authorized_keys2", home),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_passwd_skips_system_accounts() {
        let contents = "\
root:x:0:0:root:/root:/bin/bash
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
nobody:x:65534:65534:nobody:/nonexistent:/usr/sbin/nologin
alice:x:1000:1000:Alice:/home/alice:/bin/bash
sshd:x:101:65534::/run/sshd:/usr/sbin/nologin
";
        let users = parse_passwd(contents);
        let names: Vec<&str> = users.iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, vec!["root", "alice"]);
    }

    #[test]
    fn s2_strips_authorized_keys_options() {
        let line = "command=\"/usr/bin/git-shell\",no-pty ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIJ5lUIu0pGPM5ITaGDUUTMmCP89YZrLNyGzWxZ1n3Wnd deploy@ci";
        let stripped = strip_authorized_keys_options(line);
        assert_eq!(
            stripped,
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIJ5lUIu0pGPM5ITaGDUUTMmCP89YZrLNyGzWxZ1n3Wnd deploy@ci"
        );
        let parsed = fingerprint::parse_public_key(stripped).unwrap();
        assert_eq!(parsed.key_type_tag, "ssh-ed25519");
        assert_eq!(parsed.comment.as_deref(), Some("deploy@ci"));
    }

    #[test]
    fn authorized_keys_paths_default_to_dotssh() {
        let paths = authorized_keys_paths("/home/bob", None, "bob");
        assert_eq!(
            paths,
            vec![
                "/home/bob/.ssh/authorized_keys".to_string(),
                "/home/bob/.ssh/authorized_keys2".to_string()
            ]
        );
    }

    #[test]
    fn authorized_keys_paths_honor_sshd_config_override() {
        let overrides = vec![".ssh/authorized_keys".to_string(), "/etc/ssh/authorized_keys.%u".to_string()];
        let paths = authorized_keys_paths("/home/bob", Some(&overrides), "bob");
        assert_eq!(
            paths,
            vec![
                "/home/bob/.ssh/authorized_keys".to_string(),
                "/etc/ssh/authorized_keys.bob".to_string()
            ]
        );
    }
}
