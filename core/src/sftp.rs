// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Remote file I/O over the SSH SFTP subsystem — never a shell command, so
//! a path never needs shell-quoting and can't smuggle an argument.
//!
//! Every operation here resolves a not-found or protocol failure to `None`.
//! Protocol errors that aren't simple not-found are logged at `debug`
//! before returning `None`, per the propagation policy: a single unreadable
//! file must never abort a scan.

use russh_sftp::client::SftpSession;
use tracing::debug;

use crate::error::{KeyspiderError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub size: u64,
    pub mtime: Option<chrono::DateTime<chrono::Utc>>,
    pub octal_perms: Option<u32>,
}

pub async fn stat(sftp: &SftpSession, path: &str) -> Option<Stat> {
    match sftp.metadata(path).await {
        Ok(meta) => Some(Stat {
            size: meta.size.unwrap_or(0),
            mtime: meta
                .mtime
                .and_then(|t| chrono::DateTime::from_timestamp(t as i64, 0)),
            octal_perms: meta.permissions,
        }),
        Err(e) => {
            if !is_not_found(&e) {
                debug!(path, error = %e, "sftp stat failed");
            }
            None
        }
    }
}

pub async fn exists(sftp: &SftpSession, path: &str) -> bool {
    stat(sftp, path).await.is_some()
}

pub async fn get_size(sftp: &SftpSession, path: &str) -> Option<u64> {
    stat(sftp, path).await.map(|s| s.size)
}

/// Read up to `max_bytes`, decoding lossily as UTF-8. Content beyond the
/// limit is silently truncated — callers that need the tail use
/// `read_tail` instead.
pub async fn read(sftp: &SftpSession, path: &str, max_bytes: usize) -> Option<String> {
    let mut file = sftp.open(path).await.map_err(log_not_found(path)).ok()?;
    let mut buf = Vec::with_capacity(max_bytes.min(1 << 20));
    loop {
        if buf.len() >= max_bytes {
            break;
        }
        let want = (max_bytes - buf.len()).min(32 * 1024) as u32;
        let chunk = match russh_sftp::client::fs::File::read(&mut file, want).await {
            Ok(c) if c.is_empty() => break,
            Ok(c) => c,
            Err(_) => break,
        };
        buf.extend_from_slice(&chunk);
    }
    buf.truncate(max_bytes);
    Some(String::from_utf8_lossy(&buf).into_owned())
}

/// Seek to `file_size - min(file_size, max_bytes)`, read to end, discard
/// the first partial line if the seek landed mid-line, and keep only the
/// last `max_lines`.
pub async fn read_tail(
    sftp: &SftpSession,
    path: &str,
    max_lines: usize,
    max_bytes: u64,
) -> Option<String> {
    let meta = stat(sftp, path).await?;
    let seek_from_start = meta.size.saturating_sub(meta.size.min(max_bytes));
    let seeked_into_middle = seek_from_start > 0;

    let mut file = sftp.open(path).await.map_err(log_not_found(path)).ok()?;
    russh_sftp::client::fs::File::seek(&mut file, std::io::SeekFrom::Start(seek_from_start))
        .await
        .ok()?;

    let mut buf = Vec::new();
    loop {
        let chunk = match russh_sftp::client::fs::File::read(&mut file, 64 * 1024).await {
            Ok(c) if c.is_empty() => break,
            Ok(c) => c,
            Err(_) => break,
        };
        buf.extend_from_slice(&chunk);
    }

    let text = String::from_utf8_lossy(&buf);
    let mut lines: Vec<&str> = text.lines().collect();
    if seeked_into_middle && !lines.is_empty() {
        lines.remove(0);
    }
    let start = lines.len().saturating_sub(max_lines);
    Some(lines[start..].join("\n"))
}

/// Create (or truncate) `path` and write `contents`. Unlike the read-side
/// helpers above, a failure here genuinely aborts the caller (agent
/// deployment cannot proceed with a half-written file), so it propagates
/// instead of resolving to `None`.
pub async fn write(sftp: &SftpSession, path: &str, contents: &[u8]) -> Result<()> {
    let mut file = sftp
        .create(path)
        .await
        .map_err(|e| KeyspiderError::Protocol(format!("sftp create {path} failed: {e}")))?;
    russh_sftp::client::fs::File::write(&mut file, contents.to_vec().into())
        .await
        .map_err(|e| KeyspiderError::Protocol(format!("sftp write {path} failed: {e}")))?;
    russh_sftp::client::fs::File::shutdown(&mut file)
        .await
        .map_err(|e| KeyspiderError::Protocol(format!("sftp close {path} failed: {e}")))?;
    Ok(())
}

/// Create a directory, tolerating "already exists".
pub async fn mkdir(sftp: &SftpSession, path: &str) -> Result<()> {
    if exists(sftp, path).await {
        return Ok(());
    }
    sftp.create_dir(path)
        .await
        .map_err(|e| KeyspiderError::Protocol(format!("sftp mkdir {path} failed: {e}")))
}

/// Remove a file, tolerating "already absent".
pub async fn remove_file(sftp: &SftpSession, path: &str) -> Result<()> {
    match sftp.remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(KeyspiderError::Protocol(format!("sftp remove {path} failed: {e}"))),
    }
}

/// Remove an (empty) directory, tolerating "already absent".
pub async fn remove_dir(sftp: &SftpSession, path: &str) -> Result<()> {
    match sftp.remove_dir(path).await {
        Ok(()) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(KeyspiderError::Protocol(format!("sftp rmdir {path} failed: {e}"))),
    }
}

pub async fn list_dir(sftp: &SftpSession, path: &str) -> Option<Vec<String>> {
    match sftp.read_dir(path).await {
        Ok(entries) => Some(entries.map(|e| e.file_name()).collect()),
        Err(e) => {
            if !is_not_found(&e) {
                debug!(path, error = %e, "sftp list_dir failed");
            }
            None
        }
    }
}

fn log_not_found(path: &str) -> impl Fn(russh_sftp::client::error::Error) + '_ {
    move |e| {
        if !is_not_found(&e) {
            debug!(path, error = %e, "sftp open failed");
        }
    }
}

fn is_not_found(e: &russh_sftp::client::error::Error) -> bool {
    matches!(
        e,
        russh_sftp::client::error::Error::Status(s)
            if s.status_code == russh_sftp::protocol::StatusCode::NoSuchFile
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_tail_joins_with_newlines() {
        let lines = vec!["a", "b", "c"];
        let joined = lines[lines.len().saturating_sub(2)..].join("\n");
        assert_eq!(joined, "b\nc");
    }
}
