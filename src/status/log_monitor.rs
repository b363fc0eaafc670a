use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use directories_next::BaseDirs;
use log::{debug, warn};
use regex::{Regex, RegexBuilder};

use crate::status::source::StatusSource;
use crate::status::types::StatusCode;

/**
 * How many bytes (from the end of the log file) are inspected on every poll.
 */
pub const TAIL_BYTES: u64 = 5000;

// Classic client: "Setting the taskbar overlay icon - Away"
// New client: "SetBadge Setting badge: ... status Away" or "availability: Away"
const PRESENCE_PATTERN: &str =
    r"(?:SetBadge Setting badge:.*status |Setting the taskbar overlay icon - |availability: )(\w+)";
const CALL_ACTIVITY_PATTERN: &str =
    r"(?:name: desktop_call_state_change_send|StatusIndicatorStateService: Added )(\w+)";

fn build_pattern(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .expect("Failed to compile built-in log pattern")
}

/// Default location of the chat client's log. Prefers the classic client's `logs.txt`, and falls
/// back to the new client's log directory when only that one exists.
pub fn default_log_path() -> Option<PathBuf> {
    let dirs = BaseDirs::new()?;
    let classic = dirs.config_dir().join("Microsoft").join("Teams").join("logs.txt");
    let new_client = dirs
        .data_local_dir()
        .join("Packages")
        .join("MSTeams_8wekyb3d8bbwe")
        .join("LocalCache")
        .join("Microsoft")
        .join("MSTeams")
        .join("Logs");

    if new_client.is_dir() && !classic.exists() {
        return Some(new_client);
    }

    Some(classic)
}

/// Tails the chat client's log file and pattern-matches the most recent presence change.
pub struct LogStatusSource {
    path: PathBuf,
    presence: Regex,
    call_activity: Regex,
    last_status: StatusCode,
}

impl LogStatusSource {
    pub fn new(path: PathBuf) -> Self {
        LogStatusSource {
            path,
            presence: build_pattern(PRESENCE_PATTERN),
            call_activity: build_pattern(CALL_ACTIVITY_PATTERN),
            last_status: StatusCode::Unknown,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // The path is either a single log file, or a directory of *.log files of which the most
    // recently written one is used.
    fn latest_log_file(&self) -> io::Result<Option<PathBuf>> {
        if self.path.is_file() {
            return Ok(Some(self.path.clone()));
        }

        if !self.path.is_dir() {
            return Ok(None);
        }

        let mut latest: Option<(SystemTime, PathBuf)> = None;
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "log") {
                continue;
            }

            let modified = entry.metadata()?.modified()?;
            if latest.as_ref().map_or(true, |(time, _)| modified > *time) {
                latest = Some((modified, path));
            }
        }

        Ok(latest.map(|(_, path)| path))
    }

    fn read_tail(path: &Path) -> io::Result<String> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if len > TAIL_BYTES {
            file.seek(SeekFrom::End(-(TAIL_BYTES as i64)))?;
        }

        let mut content = Vec::with_capacity(TAIL_BYTES as usize);
        file.read_to_end(&mut content)?;
        Ok(String::from_utf8_lossy(&content).into_owned())
    }

    /// Call activity wins over the presence badge; within each kind the last match wins.
    pub fn parse_status(&self, content: &str) -> StatusCode {
        let last_token = |pattern: &Regex| {
            pattern
                .captures_iter(content)
                .last()
                .and_then(|captures| captures.get(1))
                .map(|token| StatusCode::from_log_token(token.as_str()))
                .filter(|status| status.is_known())
        };

        let presence = last_token(&self.presence);
        let call = last_token(&self.call_activity);
        debug!("Parsed log tail: call={:?} presence={:?}", call, presence);

        call.or(presence).unwrap_or(StatusCode::Unknown)
    }

    fn poll(&mut self) -> io::Result<StatusCode> {
        let file = match self.latest_log_file()? {
            Some(file) => file,
            None => {
                debug!("No log file found at {}", self.path.to_string_lossy());
                return Ok(StatusCode::Offline);
            },
        };

        let content = Self::read_tail(&file)?;
        let status = self.parse_status(&content);

        if status.is_known() && status != self.last_status {
            debug!("Log status changed {} -> {}", self.last_status, status);
            self.last_status = status;
        }

        Ok(self.last_status)
    }
}

impl StatusSource for LogStatusSource {
    fn current_status(&mut self) -> StatusCode {
        match self.poll() {
            Ok(status) => status,
            Err(err) => {
                warn!("Failed to read log {}: {}", self.path.to_string_lossy(), err);
                StatusCode::Unknown
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DIR_COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn scratch_dir() -> PathBuf {
        let n = DIR_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("presence-beacon-log-{}-{}", std::process::id(), n));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn call_activity_takes_precedence() {
        let source = LogStatusSource::new(PathBuf::from("unused"));
        let content = "\
            availability: Available\n\
            StatusIndicatorStateService: Added InACall\n\
            availability: Busy\n";
        assert_eq!(source.parse_status(content), StatusCode::InACall);
    }

    #[test]
    fn unrecognized_call_state_does_not_hide_presence() {
        let source = LogStatusSource::new(PathBuf::from("unused"));
        let content = "\
            availability: Away\n\
            StatusIndicatorStateService: Added NewActivity\n";
        assert_eq!(source.parse_status(content), StatusCode::Away);
    }

    #[test]
    fn last_presence_match_wins() {
        let source = LogStatusSource::new(PathBuf::from("unused"));
        let content = "\
            Setting the taskbar overlay icon - Away\n\
            SetBadge Setting badge: foo status DoNotDisturb\n";
        assert_eq!(source.parse_status(content), StatusCode::DoNotDisturb);
        assert_eq!(source.parse_status("nothing relevant"), StatusCode::Unknown);
    }

    #[test]
    fn missing_path_reports_offline() {
        let mut source = LogStatusSource::new(scratch_dir().join("does-not-exist.txt"));
        assert_eq!(source.current_status(), StatusCode::Offline);
    }

    #[test]
    fn empty_directory_reports_offline() {
        let mut source = LogStatusSource::new(scratch_dir());
        assert_eq!(source.current_status(), StatusCode::Offline);
    }

    #[test]
    fn remembers_last_status_when_tail_has_no_match() {
        let dir = scratch_dir();
        let path = dir.join("logs.txt");
        fs::write(&path, "availability: Busy\n").unwrap();

        let mut source = LogStatusSource::new(path.clone());
        assert_eq!(source.current_status(), StatusCode::Busy);

        // push the match out of the inspected tail
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&vec![b'x'; TAIL_BYTES as usize + 10]).unwrap();
        assert_eq!(source.current_status(), StatusCode::Busy);
    }

    #[test]
    fn uses_log_files_from_directory() {
        let dir = scratch_dir();
        fs::write(dir.join("notes.txt"), "availability: Busy\n").unwrap();
        fs::write(dir.join("MSTeams_1.log"), "availability: Away\n").unwrap();

        let mut source = LogStatusSource::new(dir);
        assert_eq!(source.current_status(), StatusCode::Away);
    }
}
