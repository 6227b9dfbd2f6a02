//! Filename sanitizing
//!
//! Filename components arriving from the network are untrusted; they are
//! rewritten so they cannot escape the download directory or collide with
//! platform-reserved names.

use crate::table::StorageError;

const WINDOWS_RESERVED: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "CLOCK$", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
    "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Target platform for sanitizing rules
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Platform {
    Unix,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }
}

/// Make a single filename component safe for the current platform
pub fn safe_filename(filename: &str) -> Result<String, StorageError> {
    safe_filename_for(filename, Platform::current())
}

/// Make a single filename component safe for a platform.
///
/// Separator and control characters become underscores. Fails for names
/// that remain unsafe after rewriting, such as a parent-directory
/// reference or a Windows reserved device name.
pub fn safe_filename_for(filename: &str, platform: Platform) -> Result<String, StorageError> {
    let mut out: String = filename
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            '"' | '*' | ':' | '<' | '>' | '?' | '|' if platform == Platform::Windows => '_',
            c if platform == Platform::Windows && (c as u32) < 32 => '_',
            c => c,
        })
        .collect();

    if platform == Platform::Windows {
        out = out.trim_end().to_string();

        if out.ends_with('.') {
            return Err(StorageError::UnsafeFilename(
                "ends with fullstop".to_string(),
            ));
        }

        let stem = out.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(&out);

        if WINDOWS_RESERVED.contains(&stem.to_ascii_uppercase().as_str()) {
            return Err(StorageError::UnsafeFilename(
                "reserved device name".to_string(),
            ));
        }
    }

    if out == ".." {
        return Err(StorageError::UnsafeFilename(
            "parent directory".to_string(),
        ));
    }

    Ok(out)
}
