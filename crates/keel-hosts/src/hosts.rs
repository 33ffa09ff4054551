//! Atomic, serialized hosts-file updates.
//!
//! Records are emitted as `<IP>\t<hosts>\n`. Every operation takes a
//! per-path mutex from a process-wide registry so concurrent updates to the
//! same container's file serialize; [`drop_path`] retires the registry
//! entry when the container goes away.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use keel_common::KeelResult;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;

use crate::lease::FileLease;

/// A single hosts-file record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Hostname(s), space-separated.
    pub hosts: String,
    /// Address, v4 or v6.
    pub ip: String,
}

impl Record {
    /// Create a record.
    pub fn new(ip: impl Into<String>, hosts: impl Into<String>) -> Self {
        Self {
            hosts: hosts.into(),
            ip: ip.into(),
        }
    }

    fn line(&self) -> String {
        format!("{}\t{}\n", self.ip, self.hosts)
    }
}

/// Where [`add`] places new records relative to existing content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMode {
    /// New records go after the existing content.
    Append,
    /// New records go before the existing content.
    Prepend,
}

/// IPv4 built-in written by [`build`] and [`build_no_ipv6`].
const DEFAULT_V4: &[(&str, &str)] = &[("127.0.0.1", "localhost")];

/// IPv6 built-ins, present only when the file is in IPv6-enabled mode.
const DEFAULT_V6: &[(&str, &str)] = &[
    ("::1", "localhost ip6-localhost ip6-loopback"),
    ("fe00::0", "ip6-localnet"),
    ("ff00::0", "ip6-mcastprefix"),
    ("ff02::1", "ip6-allnodes"),
    ("ff02::2", "ip6-allrouters"),
];

static PATH_LOCKS: Lazy<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn lock_for(path: &Path) -> Arc<Mutex<()>> {
    PATH_LOCKS
        .lock()
        .entry(path.to_path_buf())
        .or_default()
        .clone()
}

/// Forget the per-path mutex for `path`.
pub fn drop_path(path: &Path) {
    PATH_LOCKS.lock().remove(path);
}

/// Write a fresh hosts file: IPv4 and IPv6 defaults, then `extra`.
/// Truncates any existing file.
///
/// # Errors
///
/// Surfaces the underlying I/O error unchanged.
pub fn build(path: &Path, extra: &[Record]) -> KeelResult<()> {
    build_with_defaults(path, extra, true)
}

/// Like [`build`] but without the IPv6 built-ins, for sandboxes with no
/// IPv6 connectivity.
///
/// # Errors
///
/// Surfaces the underlying I/O error unchanged.
pub fn build_no_ipv6(path: &Path, extra: &[Record]) -> KeelResult<()> {
    build_with_defaults(path, extra, false)
}

fn build_with_defaults(path: &Path, extra: &[Record], ipv6: bool) -> KeelResult<()> {
    let lock = lock_for(path);
    let _guard = lock.lock();

    let mut content = String::new();
    for (ip, hosts) in DEFAULT_V4 {
        content.push_str(&Record::new(*ip, *hosts).line());
    }
    if ipv6 {
        for (ip, hosts) in DEFAULT_V6 {
            content.push_str(&Record::new(*ip, *hosts).line());
        }
    }
    for record in extra {
        content.push_str(&record.line());
    }

    write_serialized(path, content.as_bytes())
}

/// Add `records` to an existing hosts file. Duplicates are allowed; only
/// [`delete`] matches by name.
///
/// # Errors
///
/// Surfaces the underlying I/O error unchanged.
pub fn add(path: &Path, mode: AddMode, records: &[Record]) -> KeelResult<()> {
    if records.is_empty() {
        return Ok(());
    }

    let lock = lock_for(path);
    let _guard = lock.lock();

    let existing = std::fs::read_to_string(path)?;
    let added: String = records.iter().map(Record::line).collect();
    let content = match mode {
        AddMode::Append => format!("{existing}{added}"),
        AddMode::Prepend => format!("{added}{existing}"),
    };

    tracing::debug!(path = %path.display(), count = records.len(), "Adding hosts records");
    write_serialized(path, content.as_bytes())
}

/// Remove every line whose remainder after the tab exactly matches one of
/// the record host strings. Comment lines and blank lines are preserved.
///
/// Matching is by name only; a record for the same name on another network
/// keeps its address until the file is rebuilt.
///
/// # Errors
///
/// Surfaces the underlying I/O error unchanged.
pub fn delete(path: &Path, records: &[Record]) -> KeelResult<()> {
    if records.is_empty() {
        return Ok(());
    }

    let lock = lock_for(path);
    let _guard = lock.lock();

    let existing = std::fs::read_to_string(path)?;
    let mut content = String::with_capacity(existing.len());

    for line in existing.lines() {
        let keep = if line.trim().is_empty() || line.trim_start().starts_with('#') {
            true
        } else {
            match line.split_once('\t') {
                Some((_, names)) => !records.iter().any(|r| r.hosts == names),
                None => true,
            }
        };
        if keep {
            content.push_str(line);
            content.push('\n');
        }
    }

    tracing::debug!(path = %path.display(), count = records.len(), "Deleted hosts records");
    write_serialized(path, content.as_bytes())
}

/// Rewrite the address of `hostname` in place to `ip`.
///
/// # Errors
///
/// Surfaces I/O errors unchanged; an invalid hostname pattern is an
/// internal error.
pub fn update(path: &Path, ip: &str, hostname: &str) -> KeelResult<()> {
    let lock = lock_for(path);
    let _guard = lock.lock();

    let existing = std::fs::read_to_string(path)?;
    // Anchor on the tab so "db" does not rewrite "db-replica"; the trailing
    // class keeps FQDN-style "db.internal" matchable and end-of-input covers
    // a final record with no trailing newline.
    let pattern = format!(r"(\S*)(\t{})(\s|\.|$)", regex::escape(hostname));
    let re = Regex::new(&pattern)
        .map_err(|e| keel_common::KeelError::internal(format!("hostname pattern: {e}")))?;
    let content = re.replace_all(&existing, format!("{ip}${{2}}${{3}}"));

    tracing::debug!(path = %path.display(), hostname, ip, "Updated hosts record");
    write_serialized(path, content.as_bytes())
}

/// Rewrite `path` under a best-effort write lease so readers block rather
/// than observe a truncated file.
fn write_serialized(path: &Path, content: &[u8]) -> KeelResult<()> {
    let mut lease = FileLease::acquire(path, 3, Duration::from_millis(10), false)?;
    lease.write_file(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        (dir, path)
    }

    #[test]
    fn build_writes_defaults_and_extras() {
        let (_dir, path) = scratch();
        build(&path, &[Record::new("172.18.0.2", "web")]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("127.0.0.1\tlocalhost\n"));
        assert!(content.contains("::1\tlocalhost ip6-localhost ip6-loopback\n"));
        assert!(content.contains("ff02::2\tip6-allrouters\n"));
        assert!(content.ends_with("172.18.0.2\tweb\n"));
    }

    #[test]
    fn build_no_ipv6_omits_v6_builtins() {
        let (_dir, path) = scratch();
        build_no_ipv6(&path, &[]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "127.0.0.1\tlocalhost\n");
    }

    #[test]
    fn add_appends_record() {
        // S6 from the scenario list.
        let (_dir, path) = scratch();
        std::fs::write(&path, "127.0.0.1\tlocalhost\n").unwrap();

        add(&path, AddMode::Append, &[Record::new("10.0.0.1", "alpha")]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "127.0.0.1\tlocalhost\n10.0.0.1\talpha\n");
    }

    #[test]
    fn add_prepend_goes_first() {
        let (_dir, path) = scratch();
        std::fs::write(&path, "127.0.0.1\tlocalhost\n").unwrap();

        add(&path, AddMode::Prepend, &[Record::new("10.0.0.1", "alpha")]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "10.0.0.1\talpha\n127.0.0.1\tlocalhost\n");
    }

    #[test]
    fn add_then_delete_roundtrips() {
        let (_dir, path) = scratch();
        build(&path, &[]).unwrap();
        let baseline = std::fs::read_to_string(&path).unwrap();

        let records = vec![
            Record::new("10.0.0.1", "alpha"),
            Record::new("10.0.0.2", "beta beta.local"),
        ];
        add(&path, AddMode::Append, &records).unwrap();
        delete(&path, &records).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), baseline);
    }

    #[test]
    fn delete_preserves_comments_and_blanks() {
        let (_dir, path) = scratch();
        std::fs::write(
            &path,
            "# managed by keel\n\n10.0.0.1\talpha\n10.0.0.2\tbeta\n",
        )
        .unwrap();

        delete(&path, &[Record::new("10.0.0.1", "alpha")]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "# managed by keel\n\n10.0.0.2\tbeta\n");
    }

    #[test]
    fn delete_matches_full_name_suffix_only() {
        let (_dir, path) = scratch();
        std::fs::write(&path, "10.0.0.1\talpha\n10.0.0.2\talpha beta\n").unwrap();

        delete(&path, &[Record::new("ignored", "alpha")]).unwrap();

        // "alpha beta" is not an exact match for "alpha".
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "10.0.0.2\talpha beta\n");
    }

    #[test]
    fn update_rewrites_ip_in_place() {
        let (_dir, path) = scratch();
        std::fs::write(&path, "10.0.0.1\tweb\n10.0.0.2\tweb-replica\n").unwrap();

        update(&path, "10.0.9.9", "web").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "10.0.9.9\tweb\n10.0.0.2\tweb-replica\n");
    }

    #[test]
    fn update_reaches_a_final_record_without_a_newline() {
        let (_dir, path) = scratch();
        std::fs::write(&path, "10.0.0.1\tweb\n10.0.0.2\tdb").unwrap();

        update(&path, "10.0.9.9", "db").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "10.0.0.1\tweb\n10.0.9.9\tdb");
    }

    #[test]
    fn concurrent_adds_are_serialized() {
        let (_dir, path) = scratch();
        std::fs::write(&path, "").unwrap();

        let mut handles = Vec::new();
        for t in 0..4u8 {
            let path = path.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..25u8 {
                    add(
                        &path,
                        AddMode::Append,
                        &[Record::new(format!("10.0.{t}.{i}"), format!("h{t}x{i}"))],
                    )
                    .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 100);
    }

    #[test]
    fn drop_path_forgets_lock() {
        let (_dir, path) = scratch();
        std::fs::write(&path, "").unwrap();
        add(&path, AddMode::Append, &[Record::new("10.0.0.1", "a")]).unwrap();
        drop_path(&path);
        // Operations after drop re-register transparently.
        add(&path, AddMode::Append, &[Record::new("10.0.0.2", "b")]).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
    }
}
