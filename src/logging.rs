// src/logging.rs
//
// Timestamped logging for the bridge. `tlog!` prepends `HH:MM:SS.mmm` local
// time to every line written to stderr, and mirrors it to a log file when
// file logging is enabled.

use std::path::Path;
use std::sync::Mutex;

/// Global log file handle. When `Some`, `tlog!` writes to both stderr and this file.
pub(crate) static LOG_FILE: Mutex<Option<std::fs::File>> = Mutex::new(None);

/// Timestamped logging macro.
macro_rules! tlog {
    ($($arg:tt)*) => {{
        use std::io::Write as _;
        let msg = format!(
            "{} {}",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            format_args!($($arg)*)
        );
        eprintln!("{}", msg);
        if let Ok(mut guard) = $crate::logging::LOG_FILE.lock() {
            if let Some(ref mut f) = *guard {
                let _ = writeln!(f, "{}", msg);
            }
        }
    }};
}

pub(crate) use tlog;

/// Initialise file logging under the given directory.
/// Creates a timestamped log file and points a `canserial.log` symlink at it.
pub fn init_file_logging(log_dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(log_dir).map_err(|e| format!("create log dir: {}", e))?;

    let filename = chrono::Local::now()
        .format("%Y%m%d-%H%M%S-canserial.log")
        .to_string();
    let log_path = log_dir.join(&filename);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| format!("create log file: {}", e))?;

    // Point canserial.log at the newest file
    let link = log_dir.join("canserial.log");
    let _ = std::fs::remove_file(&link);
    if let Err(e) = std::os::unix::fs::symlink(&filename, &link) {
        eprintln!("[logging] canserial.log symlink failed: {}", e);
    }

    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some(file);
    }

    tlog!("[logging] writing to {}", log_path.display());
    Ok(())
}
