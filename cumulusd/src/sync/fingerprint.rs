use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

use md5::Context;
use tokio::io::AsyncReadExt;

/// md5 hex digest of a file's bytes, read in chunks.
pub async fn file_digest(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut context = Context::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        context.consume(&buf[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}

/// Aggregate digest of a directory: md5 over the concatenation of its
/// immediate child file digests in indexed insertion order. Content changes
/// below a directory become visible without a full re-walk.
pub fn child_digest<I, S>(hashes: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut joined = String::new();
    for hash in hashes {
        joined.push_str(hash.as_ref());
    }
    format!("{:x}", md5::compute(joined.as_bytes()))
}

pub fn mtime_of(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|stamp| stamp.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_digest_matches_md5_of_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"x").unwrap();
        assert_eq!(
            file_digest(&path).await.unwrap(),
            format!("{:x}", md5::compute(b"x"))
        );
    }

    #[tokio::test]
    async fn file_digest_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(file_digest(&dir.path().join("gone")).await.is_err());
    }

    #[test]
    fn child_digest_depends_on_order_and_membership() {
        let two = child_digest(["h1", "h2"]);
        assert_eq!(two, format!("{:x}", md5::compute(b"h1h2")));
        assert_ne!(two, child_digest(["h2", "h1"]));
        assert_ne!(two, child_digest(["h1", "h2", "h3"]));
        assert_eq!(two, child_digest(["h1", "h2"]));
    }
}
