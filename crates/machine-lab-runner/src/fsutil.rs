use anyhow::Result;
use chrono::Utc;
use std::collections::VecDeque;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Write through a temp file and rename, so pollers never observe a partial file.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Last `lines` lines of a text file, joined with `\n`. Every line of the
/// file, not just the tail, is passed to `visit`.
pub fn tail_lines_with(path: &Path, lines: usize, mut visit: impl FnMut(&str)) -> Result<String> {
    let file = fs::File::open(path)?;
    let mut window: VecDeque<String> = VecDeque::with_capacity(lines + 1);
    for line in BufReader::new(file).lines() {
        let line = line?;
        visit(&line);
        window.push_back(line);
        if window.len() > lines {
            window.pop_front();
        }
    }
    Ok(Vec::from(window).join("\n"))
}

/// Append text to a file, creating it if needed.
pub fn append_text(path: &Path, text: &str) -> Result<()> {
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(text.as_bytes())?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn scratch_dir(label: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "machine_lab_{}_{}_{}",
        label,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    fs::create_dir_all(&dir).expect("scratch dir");
    dir
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_only_the_last_lines() {
        let root = scratch_dir("tail");
        let path = root.join("logs");
        let body: String = (1..=25).map(|i| format!("line {}\n", i)).collect();
        fs::write(&path, body).expect("write logs");

        let tail = tail_lines_with(&path, 3, |_| {}).expect("tail");
        assert_eq!(tail, "line 23\nline 24\nline 25");

        let mut seen = 0;
        let tail = tail_lines_with(&path, 2, |_| seen += 1).expect("tail");
        assert_eq!(tail, "line 24\nline 25");
        assert_eq!(seen, 25);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn atomic_write_replaces_existing_content() {
        let root = scratch_dir("atomic");
        let path = root.join("run").join("status");
        atomic_write_bytes(&path, b"").expect("first write");
        atomic_write_bytes(&path, b"OK\n").expect("second write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "OK\n");
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind");
        let _ = fs::remove_dir_all(root);
    }
}
