//! Backend-independent upload and naming rules

use regex::Regex;
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Types never accepted, whatever the backend
const REJECTED_TYPES: &[&str] = &["html", "svg"];

fn illegal_name_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"[\\/:*?"<>|]"#).expect("Invalid regex"))
}

/// Lower-cased text after the last `.`
pub fn file_extension(file_name: &str) -> Result<String> {
    let ext = match file_name.rfind('.') {
        Some(idx) => file_name[idx + 1..].trim().to_lowercase(),
        None => String::new(),
    };
    if ext.is_empty() {
        return Err(Error::validation(format!(
            "File '{}' has no type extension",
            file_name
        )));
    }
    Ok(ext)
}

/// Reject types no backend will take
pub fn check_file_type(file_type: &str) -> Result<()> {
    if REJECTED_TYPES.contains(&file_type) {
        return Err(Error::UnsupportedFileType(file_type.to_string()));
    }
    Ok(())
}

/// Check a type against a backend allow-list
pub fn check_supported(file_type: &str, supported: &[String]) -> Result<()> {
    if supported.iter().any(|t| t.eq_ignore_ascii_case(file_type)) {
        Ok(())
    } else {
        Err(Error::UnsupportedFileType(file_type.to_string()))
    }
}

pub fn check_size(file_name: &str, size: u64, limit: u64) -> Result<()> {
    if size > limit {
        return Err(Error::validation(format!(
            "File '{}' is {} bytes, limit is {} bytes",
            file_name, size, limit
        )));
    }
    Ok(())
}

/// Character count as shown to users: each line counts its characters plus one for the break
pub fn count_characters(text: &str) -> u64 {
    text.lines().map(|line| line.chars().count() as u64 + 1).sum()
}

/// Folder and file display names
pub fn validate_node_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::validation("Name must not be empty"));
    }
    if illegal_name_chars().is_match(name) {
        return Err(Error::validation(format!(
            "Name '{}' contains one of \\ / : * ? \" < > |",
            name
        )));
    }
    Ok(name.to_string())
}
