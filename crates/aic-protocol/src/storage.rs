use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use crate::error::{AicError, AicResult};

/// Backoff schedule for `TransientStorageError`, §7: 100 ms, 200 ms, 400 ms,
/// max 3 attempts total (so only the first two delays are ever used).
const RETRY_DELAYS_MS: [u64; 3] = [100, 200, 400];
const MAX_ATTEMPTS: usize = 3;

/// Retries `op` up to `MAX_ATTEMPTS` times when it returns a transient
/// error, sleeping the backoff schedule between attempts. Non-transient
/// errors and the final attempt's error are returned immediately.
pub async fn with_retry<T, F, Fut>(mut op: F) -> AicResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = AicResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                let delay = RETRY_DELAYS_MS[attempt];
                warn!(attempt, delay_ms = delay, error = %err, "retrying transient storage error");
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn per_path_locks() -> &'static Mutex<HashMap<PathBuf, Arc<Mutex<()>>>> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    LOCKS.get_or_init(|| Mutex::new(HashMap::new()))
}

async fn lock_for(path: &Path) -> Arc<Mutex<()>> {
    let mut locks = per_path_locks().lock().await;
    locks
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Appends one JSON-encoded line to `path`, creating it if absent. Writers
/// serialize per path via an in-process lock, matching the teacher's
/// per-key async mutex around `OpenOptions::new().create(true).append(true)`.
#[instrument(skip(value), fields(path = %path.display()))]
pub async fn append_jsonl<T: Serialize + Sync>(path: &Path, value: &T) -> AicResult<()> {
    let lock = lock_for(path).await;
    let _guard = lock.lock().await;

    with_retry(|| async {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AicError::TransientStorage(format!("creating {parent:?}: {e}")))?;
        }

        let mut line = serde_json::to_string(value)
            .map_err(|e| AicError::Fatal(format!("serializing jsonl record: {e}")))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| AicError::TransientStorage(format!("opening {path:?}: {e}")))?;

        file.write_all(line.as_bytes())
            .await
            .map_err(|e| AicError::TransientStorage(format!("writing {path:?}: {e}")))?;
        file.flush()
            .await
            .map_err(|e| AicError::TransientStorage(format!("flushing {path:?}: {e}")))?;
        Ok(())
    })
    .await
}

/// Reads every well-formed JSON line from `path`. A missing file yields an
/// empty vector. A trailing line that fails to parse is assumed to be a
/// partial write-in-progress and is silently discarded; any earlier
/// malformed line is a hard error.
#[instrument(fields(path = %path.display()))]
pub async fn read_jsonl<T: DeserializeOwned>(path: &Path) -> AicResult<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let raw = with_retry(|| async {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AicError::TransientStorage(format!("reading {path:?}: {e}")))
    })
    .await?;

    let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut records = Vec::with_capacity(lines.len());

    for (index, line) in lines.iter().enumerate() {
        match serde_json::from_str::<T>(line) {
            Ok(record) => records.push(record),
            Err(err) if index == lines.len() - 1 => {
                warn!(path = %path.display(), %err, "discarding partial trailing jsonl line");
            }
            Err(err) => {
                return Err(AicError::Fatal(format!(
                    "malformed jsonl line {index} in {path:?}: {err}"
                )));
            }
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Record {
        id: u32,
    }

    #[tokio::test]
    async fn append_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");

        for id in 0..5 {
            append_jsonl(&path, &Record { id }).await.unwrap();
        }

        let records: Vec<Record> = read_jsonl(&path).await.unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[4], Record { id: 4 });
    }

    #[tokio::test]
    async fn read_missing_file_is_empty() {
        let records: Vec<Record> = read_jsonl(Path::new("/nonexistent/log.jsonl")).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn partial_trailing_line_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        tokio::fs::write(&path, "{\"id\":1}\n{\"id\":2}\n{\"id\":3").await.unwrap();

        let records: Vec<Record> = read_jsonl(&path).await.unwrap();
        assert_eq!(records, vec![Record { id: 1 }, Record { id: 2 }]);
    }

    #[tokio::test]
    async fn retry_succeeds_on_third_attempt() {
        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let result = with_retry(|| async {
            let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n < 2 {
                Err(AicError::TransientStorage("disk I/O error".into()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retry_surfaces_after_max_attempts() {
        let result: AicResult<()> = with_retry(|| async {
            Err(AicError::TransientStorage("disk I/O error".into()))
        })
        .await;
        assert!(result.is_err());
    }
}
