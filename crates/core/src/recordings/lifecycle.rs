use crate::clock::Clock;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

/// Verdict on a recording file. The classifier is the sole authority;
/// nothing else in the system decides whether a recording is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Lifecycle {
    Finished,
    Recording,
}

/// Markers that always mean "still being written"
const LOCK_SUFFIXES: [&str; 3] = [".partial", ".lock", ".tmp"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecyclePolicy {
    /// A file must be unmodified this long to count as finished
    pub stable_window: Duration,
    /// Smaller files are presumed still recording
    pub min_size: u64,
    /// Acceptable recording extensions, lowercase
    pub extensions: Vec<String>,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            stable_window: Duration::from_secs(120),
            min_size: 1024 * 1024,
            extensions: vec!["ts".to_string(), "mkv".to_string(), "mp4".to_string()],
        }
    }
}

impl LifecyclePolicy {
    pub fn classify(&self, path: &Path, clock: &dyn Clock) -> io::Result<Lifecycle> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        if LOCK_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            return Ok(Lifecycle::Recording);
        }

        let ext_ok = path
            .extension()
            .map(|e| {
                let e = e.to_string_lossy().to_ascii_lowercase();
                self.extensions.iter().any(|allowed| *allowed == e)
            })
            .unwrap_or(false);
        if !ext_ok {
            return Ok(Lifecycle::Recording);
        }

        // Sibling lock file, e.g. `show.ts.lock` next to `show.ts`
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        if Path::new(&lock_name).exists() {
            return Ok(Lifecycle::Recording);
        }

        let meta = path.metadata()?;
        if meta.len() < self.min_size {
            return Ok(Lifecycle::Recording);
        }

        let mtime_unix = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        let age = clock.now_unix().saturating_sub(mtime_unix);
        if age < self.stable_window.as_secs() as i64 {
            return Ok(Lifecycle::Recording);
        }

        Ok(Lifecycle::Finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::fs;
    use std::time::SystemTime;

    fn policy() -> LifecyclePolicy {
        LifecyclePolicy {
            stable_window: Duration::from_secs(120),
            min_size: 4,
            extensions: vec!["ts".to_string()],
        }
    }

    fn now_unix() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    #[test]
    fn old_complete_file_is_finished() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("show.ts");
        fs::write(&file, b"0123456789").unwrap();

        // Pretend the file was written long ago by moving the clock forward
        let clock = ManualClock::new(now_unix());
        clock.advance(Duration::from_secs(600));
        assert_eq!(
            policy().classify(&file, &clock).unwrap(),
            Lifecycle::Finished
        );
    }

    #[test]
    fn fresh_file_is_still_recording() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("show.ts");
        fs::write(&file, b"0123456789").unwrap();

        let clock = ManualClock::new(now_unix());
        assert_eq!(
            policy().classify(&file, &clock).unwrap(),
            Lifecycle::Recording
        );
    }

    #[test]
    fn lock_suffixes_mean_recording() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(now_unix());
        clock.advance(Duration::from_secs(600));
        for name in ["a.ts.partial", "a.ts.LOCK", "a.tmp"] {
            let file = tmp.path().join(name);
            fs::write(&file, b"0123456789").unwrap();
            assert_eq!(
                policy().classify(&file, &clock).unwrap(),
                Lifecycle::Recording,
                "{name}"
            );
        }
    }

    #[test]
    fn sibling_lock_file_means_recording() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("show.ts");
        fs::write(&file, b"0123456789").unwrap();
        fs::write(tmp.path().join("show.ts.lock"), b"").unwrap();

        let clock = ManualClock::new(now_unix());
        clock.advance(Duration::from_secs(600));
        assert_eq!(
            policy().classify(&file, &clock).unwrap(),
            Lifecycle::Recording
        );
    }

    #[test]
    fn wrong_extension_and_small_files_are_recording() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(now_unix());
        clock.advance(Duration::from_secs(600));

        let odd = tmp.path().join("notes.txt");
        fs::write(&odd, b"0123456789").unwrap();
        assert_eq!(policy().classify(&odd, &clock).unwrap(), Lifecycle::Recording);

        let tiny = tmp.path().join("tiny.ts");
        fs::write(&tiny, b"x").unwrap();
        assert_eq!(policy().classify(&tiny, &clock).unwrap(), Lifecycle::Recording);
    }

    #[test]
    fn classification_is_stable_without_fs_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("show.ts");
        fs::write(&file, b"0123456789").unwrap();
        let clock = ManualClock::new(now_unix());
        clock.advance(Duration::from_secs(600));

        let first = policy().classify(&file, &clock).unwrap();
        let second = policy().classify(&file, &clock).unwrap();
        assert_eq!(first, second);
    }
}
