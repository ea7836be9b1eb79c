//! MD5 content checksums, hex encoded.

use std::path::Path;

use md5::{Digest, Md5};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::{BucketError, Result};
use crate::stream::COPY_BUFFER_SIZE;

pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Checksum of a local file. A missing file yields [`BucketError::FileNotFound`].
pub async fn md5_file(path: &Path) -> Result<String> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(BucketError::FileNotFound(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    let mut hasher = Md5::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Whether a remote checksum proves the local content is already stored.
///
/// An absent or empty remote checksum never matches.
pub fn checksums_match(local: &str, remote: Option<&str>) -> bool {
    match remote {
        Some(remote) if !remote.is_empty() => remote.eq_ignore_ascii_case(local),
        _ => false,
    }
}
