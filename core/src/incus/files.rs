//! Instance file transfer and existence probing.

use bytes::Bytes;
use tracing::debug;

use crate::cache::Caches;
use crate::errors::{FileError, IncusError};
use crate::incus::{exec, Client};

/// Push `data` to `path` inside the instance.
pub async fn push_file(
    client: &Client,
    instance: &str,
    path: &str,
    data: Bytes,
    uid: u32,
    gid: u32,
    mode: u32,
) -> Result<(), FileError> {
    let url = file_url(client, instance, path);
    let headers: Vec<(&str, String)> = vec![
        ("x-incus-type", "file".to_string()),
        ("x-incus-uid", uid.to_string()),
        ("x-incus-gid", gid.to_string()),
        ("x-incus-mode", format!("{mode:o}")),
        ("x-incus-write", "overwrite".to_string()),
        ("content-type", "application/octet-stream".to_string()),
    ];
    let raw = client
        .transport()
        .request("POST", &url, Some(data), &headers)
        .await
        .map_err(|e| FileError::Upload(e.to_string()))?;
    if raw.status >= 400 {
        return Err(FileError::Upload(format!(
            "{path}: HTTP {}",
            raw.status
        )));
    }
    debug!(instance, path, "pushed file");
    Ok(())
}

/// Pull `path` from inside the instance.
pub async fn pull_file(client: &Client, instance: &str, path: &str) -> Result<Bytes, FileError> {
    let url = file_url(client, instance, path);
    let raw = client
        .transport()
        .request("GET", &url, None, &[])
        .await
        .map_err(|e| FileError::Download(e.to_string()))?;
    match raw.status {
        404 => Err(FileError::NotFound(path.to_string())),
        status if status >= 400 => Err(FileError::Download(format!("{path}: HTTP {status}"))),
        _ => Ok(raw.body),
    }
}

/// Delete a file inside the instance with a one-shot exec.
pub async fn remove_file(client: &Client, instance: &str, path: &str) -> Result<(), IncusError> {
    let argv = vec!["rm".to_string(), "-f".to_string(), path.to_string()];
    exec::capture(client, instance, argv, None).await.map(|_| ())
}

/// Whether `path` exists inside the instance with the given md5.
///
/// Positive results are cached (keyed by path and hash). Misses go
/// through `try_get_with` so concurrent probes for the same key share one
/// in-instance `md5sum`; an absent or mismatched file is a sentinel error
/// and stays uncached.
pub async fn file_exists(
    client: &Client,
    instance: &str,
    path: &str,
    md5sum: &str,
) -> Result<bool, IncusError> {
    let key = Caches::file_key(client.project(), instance, path, md5sum);
    let probed = client.clone();
    let instance = instance.to_string();
    let path = path.to_string();
    let md5sum = md5sum.to_string();
    let result = client
        .caches()
        .file_exists
        .try_get_with(key, async move {
            let argv = vec!["md5sum".to_string(), path.clone()];
            let output = exec::capture(&probed, &instance, argv, None)
                .await
                .map_err(FileProbe::Backend)?;
            if output.exit_code != 0 {
                return Err(FileProbe::Missing);
            }
            let matched = output
                .stdout
                .split_whitespace()
                .next()
                .map(|h| h.eq_ignore_ascii_case(&md5sum))
                .unwrap_or(false);
            if matched {
                Ok(())
            } else {
                Err(FileProbe::Missing)
            }
        })
        .await;
    match result {
        Ok(()) => Ok(true),
        Err(shared) => match &*shared {
            FileProbe::Missing => Ok(false),
            FileProbe::Backend(e) => Err(crate::incus::clone_error(e)),
        },
    }
}

/// Outcome of a single-flight existence probe that must not be cached.
#[derive(Debug)]
enum FileProbe {
    Missing,
    Backend(IncusError),
}

fn file_url(client: &Client, instance: &str, path: &str) -> String {
    format!(
        "/1.0/instances/{}/files?project={}&path={}",
        urlencoding::encode(instance),
        urlencoding::encode(client.project()),
        urlencoding::encode(path)
    )
}
