use anyhow::{Context, Result};
use sha2::Digest;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn truncate_string(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut truncated = String::new();
    for ch in text.chars() {
        if truncated.len() + ch.len_utf8() > max_bytes {
            break;
        }
        truncated.push(ch);
    }
    truncated
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Digest of a template body. JSON bodies hash in canonical form, so a
/// pretty-printed file matches the object the provider hands back.
pub fn template_digest(body: &[u8]) -> String {
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(value) => canonical_json_digest(&value),
        Err(_) => sha256_hex(body),
    }
}

pub fn canonical_json_digest(value: &serde_json::Value) -> String {
    sha256_hex(value.to_string().as_bytes())
}

pub fn now_epoch_ms() -> Result<u128> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("compute timestamp")?
        .as_millis())
}

/// Elapsed milliseconds as a `u64` for log fields.
pub fn elapsed_ms(started: std::time::Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_string("héllo", 2), "h");
        assert_eq!(truncate_string("short", 10), "short");
    }

    #[test]
    fn sha256_is_stable() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn json_templates_digest_by_content() {
        let pretty = b"{\n  \"Resources\": {},\n  \"AWSTemplateFormatVersion\": \"2010-09-09\"\n}\n";
        let compact = serde_json::json!({"AWSTemplateFormatVersion": "2010-09-09", "Resources": {}});
        assert_eq!(template_digest(pretty), canonical_json_digest(&compact));
        assert_eq!(template_digest(b"Resources: {}\n"), sha256_hex(b"Resources: {}\n"));
    }
}
