// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! On-disk layout of a queue manager working directory.
//!
//! ```text
//! <working_directory>/
//! ├── queuestore/
//! │   └── <escaped-queue-name>/
//! │       ├── queue-file-1
//! │       ├── queue-file-2
//! │       └── queue-control-data
//! ├── queue-tx-log/tx.log
//! └── queue-xa-tx-log/tx.log
//! ```

use std::{
    fmt::Write,
    path::{Path, PathBuf},
};

use snafu::ensure;

use crate::{Result, control_file::FileRef, error::InvalidQueueNameSnafu};

pub const QUEUE_STORE_DIR: &str = "queuestore";
pub const LOCAL_JOURNAL_DIR: &str = "queue-tx-log";
pub const XA_JOURNAL_DIR: &str = "queue-xa-tx-log";
pub const JOURNAL_FILE_NAME: &str = "tx.log";
pub const CONTROL_FILE_NAME: &str = "queue-control-data";
pub const REWRITE_FILE_NAME: &str = "queue-file-rewrite";

/// Escapes a queue name into a single safe path component.
///
/// Every byte outside `[A-Za-z0-9._-]` becomes `%XX`, `%` included, so two
/// distinct names never map to the same directory. The special components
/// `.` and `..` are escaped entirely.
pub fn escape_queue_name(name: &str) -> String {
    if name == "." || name == ".." {
        return name.bytes().fold(String::new(), |mut out, b| {
            let _ = write!(out, "%{b:02X}");
            out
        });
    }
    let mut escaped = String::with_capacity(name.len());
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-') {
            escaped.push(char::from(b));
        } else {
            let _ = write!(escaped, "%{b:02X}");
        }
    }
    escaped
}

/// Rejects names that cannot identify a queue.
pub fn validate_queue_name(name: &str) -> Result<()> {
    ensure!(
        !name.is_empty(),
        InvalidQueueNameSnafu {
            name,
            reason: "name must not be empty",
        }
    );
    ensure!(
        name.len() <= usize::from(u16::MAX),
        InvalidQueueNameSnafu {
            name,
            reason: "name must fit in 65535 bytes",
        }
    );
    Ok(())
}

/// Directory holding all persistent queue stores.
pub fn queue_store_root<P: AsRef<Path>>(base: P) -> PathBuf { base.as_ref().join(QUEUE_STORE_DIR) }

/// Returns the directory of one queue: `base/queuestore/<escaped-name>`.
pub fn queue_dir<P: AsRef<Path>>(base: P, name: &str) -> PathBuf {
    queue_store_root(base).join(escape_queue_name(name))
}

/// Returns the path of a record file inside a queue directory.
pub fn record_file_path<P: AsRef<Path>>(queue_dir: P, file: FileRef) -> PathBuf {
    queue_dir.as_ref().join(file.file_name())
}

/// Returns the path of the control file inside a queue directory.
pub fn control_file_path<P: AsRef<Path>>(queue_dir: P) -> PathBuf {
    queue_dir.as_ref().join(CONTROL_FILE_NAME)
}

/// Returns the scratch file used while rewriting a record file.
pub fn rewrite_file_path<P: AsRef<Path>>(queue_dir: P) -> PathBuf {
    queue_dir.as_ref().join(REWRITE_FILE_NAME)
}

/// Returns the local transaction journal path: `base/queue-tx-log/tx.log`.
pub fn local_journal_path<P: AsRef<Path>>(base: P) -> PathBuf {
    base.as_ref().join(LOCAL_JOURNAL_DIR).join(JOURNAL_FILE_NAME)
}

/// Returns the XA transaction journal path: `base/queue-xa-tx-log/tx.log`.
pub fn xa_journal_path<P: AsRef<Path>>(base: P) -> PathBuf {
    base.as_ref().join(XA_JOURNAL_DIR).join(JOURNAL_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("orders", "orders" ; "plain name")]
    #[test_case("a/b", "a%2Fb" ; "slash")]
    #[test_case("a\\b", "a%5Cb" ; "backslash")]
    #[test_case("vm://in queue", "vm%3A%2F%2Fin%20queue" ; "uri with space")]
    #[test_case("q(1)*?", "q%281%29%2A%3F" ; "parens and wildcards")]
    #[test_case("<a|b>\"", "%3Ca%7Cb%3E%22" ; "angle brackets pipe quote")]
    #[test_case("already%2F", "already%252F" ; "percent is escaped")]
    #[test_case("..", "%2E%2E" ; "parent dir")]
    #[test_case("é", "%C3%A9" ; "utf8 bytes")]
    fn test_escape_queue_name(name: &str, expected: &str) {
        assert_eq!(escape_queue_name(name), expected);
    }

    #[test]
    fn test_escaping_is_injective() {
        let names = ["a/b", "a%2Fb", "a b", "a_b", "a:b", "a%3Ab", ".", "%2E"];
        let mut escaped: Vec<_> = names.iter().map(|n| escape_queue_name(n)).collect();
        escaped.sort();
        escaped.dedup();
        assert_eq!(escaped.len(), names.len());
    }

    #[test]
    fn test_escaped_name_is_single_component() {
        let dir = queue_dir("/base", "../../etc/passwd");
        assert_eq!(dir.parent(), Some(Path::new("/base/queuestore")));
    }

    #[test]
    fn test_validate_queue_name() {
        assert!(validate_queue_name("q").is_ok());
        assert!(validate_queue_name("").is_err());
    }

    #[test]
    fn test_full_paths() {
        let dir = queue_dir("/work", "in");
        assert_eq!(dir, PathBuf::from("/work/queuestore/in"));
        assert_eq!(
            record_file_path(&dir, FileRef::First),
            PathBuf::from("/work/queuestore/in/queue-file-1")
        );
        assert_eq!(
            record_file_path(&dir, FileRef::Second),
            PathBuf::from("/work/queuestore/in/queue-file-2")
        );
        assert_eq!(
            control_file_path(&dir),
            PathBuf::from("/work/queuestore/in/queue-control-data")
        );
        assert_eq!(local_journal_path("/work"), PathBuf::from("/work/queue-tx-log/tx.log"));
        assert_eq!(xa_journal_path("/work"), PathBuf::from("/work/queue-xa-tx-log/tx.log"));
    }
}
