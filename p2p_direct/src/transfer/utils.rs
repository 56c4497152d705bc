use crate::transfer::constants::MAX_FILENAME_LENGTH;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs::{File, OpenOptions};

/// Milliseconds since the Unix epoch
pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

pub fn now_millis() -> u64 {
    unix_millis(SystemTime::now())
}

/// Create (or truncate) a file with secure permissions (0o600 on Unix)
pub async fn create_secure_file(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).await
}

/// Format transfer speed from bytes and elapsed time
pub fn format_transfer_speed(bytes_transferred: u64, elapsed_secs: f64) -> String {
    if elapsed_secs <= 0.0 {
        return "Starting...".to_string();
    }

    let speed_bps = bytes_transferred as f64 / elapsed_secs;
    if speed_bps > 1_000_000.0 {
        format!("{:.2} MB/s", speed_bps / 1_000_000.0)
    } else if speed_bps > 1_000.0 {
        format!("{:.1} KB/s", speed_bps / 1_000.0)
    } else {
        format!("{:.0} B/s", speed_bps)
    }
}

/// Best-effort media type from a file extension
pub fn guess_media_type(file_name: &str) -> &'static str {
    let ext = match file_name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return "application/octet-stream",
    };
    match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

/// Sanitize file name to prevent path traversal attacks and ensure safety
pub fn sanitize_file_name(file_name: &str) -> String {
    // Take the last component of either separator style
    let file_name = file_name
        .split(['/', '\\'])
        .next_back()
        .unwrap_or("unknown_file");

    if file_name.is_empty() {
        return "unknown_file".to_string();
    }

    let mut clean_name: String = file_name.chars().filter(|c| !c.is_control()).collect();

    // See: https://learn.microsoft.com/en-us/windows/win32/fileio/naming-a-file
    let reserved_names = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    if reserved_names
        .iter()
        .any(|&r| clean_name.eq_ignore_ascii_case(r))
    {
        return "unknown_file".to_string();
    }

    if clean_name == ".." || clean_name == "." || clean_name.trim().is_empty() {
        return "unknown_file".to_string();
    }

    if clean_name.len() > MAX_FILENAME_LENGTH {
        clean_name = truncate_preserving_extension(&clean_name);
    }

    clean_name
}

fn truncate_at_char_boundary(s: &mut String, max: usize) {
    let mut cutoff = max;
    while !s.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    s.truncate(cutoff);
}

fn truncate_preserving_extension(name: &str) -> String {
    if let Some(idx) = name.rfind('.') {
        let ext_len = name.len() - idx;
        if ext_len < 20 {
            let mut base = name[..idx].to_string();
            truncate_at_char_boundary(&mut base, MAX_FILENAME_LENGTH - ext_len);
            base.push_str(&name[idx..]);
            return base;
        }
    }
    let mut truncated = name.to_string();
    truncate_at_char_boundary(&mut truncated, MAX_FILENAME_LENGTH);
    truncated
}

/// Pick `name`, or `name (n).ext`, whichever is not taken yet
pub fn deduplicate_name(name: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(name) {
        return name.to_string();
    }
    let (stem, ext) = match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    };
    let mut n = 1;
    loop {
        let candidate = format!("{} ({}){}", stem, n, ext);
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name_basic() {
        assert_eq!(sanitize_file_name("normal_file.txt"), "normal_file.txt");
        assert_eq!(sanitize_file_name("path/to/file.txt"), "file.txt");
        assert_eq!(sanitize_file_name("/absolute/path/to/file.txt"), "file.txt");
    }

    #[test]
    fn test_sanitize_file_name_windows_path() {
        assert_eq!(sanitize_file_name("path\\to\\file.txt"), "file.txt");
        assert_eq!(
            sanitize_file_name("C:\\Windows\\System32\\calc.exe"),
            "calc.exe"
        );
    }

    #[test]
    fn test_sanitize_file_name_traversal() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(
            sanitize_file_name("..\\..\\Windows\\System32\\cmd.exe"),
            "cmd.exe"
        );
        assert_eq!(sanitize_file_name("folder\\../file.txt"), "file.txt");
    }

    #[test]
    fn test_sanitize_file_name_dangerous() {
        assert_eq!(sanitize_file_name(".."), "unknown_file");
        assert_eq!(sanitize_file_name("."), "unknown_file");
        assert_eq!(sanitize_file_name(""), "unknown_file");
        assert_eq!(sanitize_file_name("/"), "unknown_file");
        assert_eq!(sanitize_file_name("a\u{0}b.txt"), "ab.txt");
    }

    #[test]
    fn test_sanitize_file_name_reserved() {
        assert_eq!(sanitize_file_name("CON"), "unknown_file");
        assert_eq!(sanitize_file_name("com1"), "unknown_file");
        assert_eq!(sanitize_file_name("concert.txt"), "concert.txt");
    }

    #[test]
    fn test_sanitize_file_name_unicode_truncate() {
        let mut long_unicode = "🦀".repeat(100);
        long_unicode.push_str(".txt");

        let sanitized = sanitize_file_name(&long_unicode);
        assert!(sanitized.len() <= MAX_FILENAME_LENGTH);
        assert!(sanitized.ends_with(".txt"));
        assert!(sanitized.trim_end_matches(".txt").ends_with('🦀'));
    }

    #[test]
    fn test_deduplicate_name() {
        let taken = ["a.txt", "a (1).txt", "noext"];
        let is_taken = |n: &str| taken.contains(&n);
        assert_eq!(deduplicate_name("b.txt", is_taken), "b.txt");
        assert_eq!(deduplicate_name("a.txt", is_taken), "a (2).txt");
        assert_eq!(deduplicate_name("noext", is_taken), "noext (1)");
    }

    #[test]
    fn test_guess_media_type() {
        assert_eq!(guess_media_type("photo.JPG"), "image/jpeg");
        assert_eq!(guess_media_type("notes.txt"), "text/plain");
        assert_eq!(guess_media_type("archive"), "application/octet-stream");
        assert_eq!(guess_media_type("weird.xyz"), "application/octet-stream");
    }

    #[test]
    fn test_format_transfer_speed() {
        assert_eq!(format_transfer_speed(100, 0.0), "Starting...");
        assert_eq!(format_transfer_speed(5_000_000, 1.0), "5.00 MB/s");
        assert_eq!(format_transfer_speed(2_000, 1.0), "2.0 KB/s");
        assert_eq!(format_transfer_speed(10, 1.0), "10 B/s");
    }

    #[tokio::test]
    async fn test_create_secure_file_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("secure.bin");
        let _file = create_secure_file(&file_path)
            .await
            .expect("Failed to create secure file");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = tokio::fs::metadata(&file_path).await.unwrap();
            assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
        }
    }
}
