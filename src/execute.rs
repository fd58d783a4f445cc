//! The executor (§4.3): performs a single byte-transfer task against local or remote
//! storage, with optional byte-range slicing. No notion of plans, progress, or
//! parallelism — callers parallelize by submitting multiple tasks to a thread pool (see
//! [`crate::dispatch`]).

use std::{
    fs::{self, File},
    io::{Read, Seek, SeekFrom, Write},
    time::Duration,
};

use crate::{
    error::{execute_error, BridgeResult},
    plan::Task,
};

const REMOTE_TIMEOUT: Duration = Duration::from_secs(300);

fn is_remote(src: &str) -> bool {
    src.starts_with("http://") || src.starts_with("https://")
}

/// Reads `[offset, offset+size)` from `task.src` when both are set, else the whole object,
/// and writes the bytes to `task.dest`, creating parent directories as needed.
pub fn execute(task: &Task) -> BridgeResult<()> {
    let bytes = if is_remote(&task.src) {
        read_remote(task)?
    } else {
        read_local(task)?
    };

    if let Some(parent) = task.dest.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            execute_error(format!("creating directory {}", parent.display()))
                .attach_context("dest", task.dest.display().to_string())
                .attach_context("cause", e.to_string())
        })?;
    }
    let mut out = File::create(&task.dest).map_err(|e| {
        execute_error(format!("creating destination {}", task.dest.display()))
            .attach_context("src", task.src.clone())
            .attach_context("cause", e.to_string())
    })?;
    out.write_all(&bytes).map_err(|e| {
        execute_error(format!("writing destination {}", task.dest.display()))
            .attach_context("src", task.src.clone())
            .attach_context("cause", e.to_string())
    })?;
    Ok(())
}

fn read_local(task: &Task) -> BridgeResult<Vec<u8>> {
    let mut file = File::open(&task.src).map_err(|e| {
        execute_error(format!("opening source {}", task.src))
            .attach_context("dest", task.dest.display().to_string())
            .attach_context("cause", e.to_string())
    })?;

    match (task.offset, task.size) {
        (Some(offset), Some(size)) => {
            file.seek(SeekFrom::Start(offset)).map_err(|e| {
                execute_error(format!("seeking source {} to offset {offset}", task.src)).attach_context("cause", e.to_string())
            })?;
            let mut buf = vec![0u8; size as usize];
            file.read_exact(&mut buf).map_err(|e| {
                execute_error(format!("reading {size} bytes from {} at offset {offset}", task.src))
                    .attach_context("cause", e.to_string())
            })?;
            Ok(buf)
        }
        _ => {
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)
                .map_err(|e| execute_error(format!("reading source {}", task.src)).attach_context("cause", e.to_string()))?;
            Ok(buf)
        }
    }
}

fn read_remote(task: &Task) -> BridgeResult<Vec<u8>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(REMOTE_TIMEOUT)
        .build()
        .map_err(|e| execute_error("building remote client").attach_context("cause", e.to_string()))?;

    let mut request = client.get(&task.src);
    if let (Some(offset), Some(size)) = (task.offset, task.size) {
        request = request.header("Range", format!("bytes={offset}-{}", offset + size - 1));
    }

    let response = request
        .send()
        .map_err(|e| execute_error(format!("fetching {}", task.src)).attach_context("cause", e.to_string()))?;
    let response = response.error_for_status().map_err(|e| {
        execute_error(format!("remote fetch of {} failed", task.src))
            .attach_context("dest", task.dest.display().to_string())
            .attach_context("cause", e.to_string())
    })?;
    let bytes = response
        .bytes()
        .map_err(|e| execute_error(format!("reading response body from {}", task.src)).attach_context("cause", e.to_string()))?;
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn executes_whole_object_local_read() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        fs::write(&src, b"hello world").unwrap();
        let dest = dir.path().join("out").join("dest.bin");
        let task = Task { src: src.display().to_string(), dest: dest.clone(), offset: None, size: None };

        execute(&task).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"hello world");
    }

    #[test]
    fn executes_partial_range_local_read() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        fs::write(&src, b"0123456789").unwrap();
        let dest = dir.path().join("dest.bin");
        let task = Task { src: src.display().to_string(), dest: dest.clone(), offset: Some(3), size: Some(4) };

        execute(&task).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"3456");
    }

    #[test]
    fn fails_with_execute_error_on_missing_source() {
        let task = Task { src: "/no/such/file".to_owned(), dest: PathBuf::from("/tmp/whatever"), offset: None, size: None };
        let err = execute(&task).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Execute);
    }
}
