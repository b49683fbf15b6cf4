// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Shell snippets that edit `authorized_keys` on a host.
//!
//! Every managed line ends with the marker `sshrotate-version=<token>`, so a
//! version's key can be removed without knowing the key itself. Both
//! snippets are idempotent: re-adding an existing line and removing an
//! absent one are no-ops.

use crate::domain::fleet::FleetError;
use crate::domain::secret::VersionId;

pub const VERSION_TAG_PREFIX: &str = "sshrotate-version=";
const MAX_TOKEN_LEN: usize = 128;
const DEFAULT_AUTHORIZED_KEYS: &str = "\"$HOME/.ssh/authorized_keys\"";

pub fn version_tag(token: &str) -> String {
    format!("{}{}", VERSION_TAG_PREFIX, token)
}

/// Version tokens end up inside shell snippets and sed patterns
pub fn validate_token(version: &VersionId) -> Result<(), FleetError> {
    let token = version.as_str();
    if token.is_empty() || token.len() > MAX_TOKEN_LEN {
        return Err(FleetError::InvalidRequest(format!(
            "version token must be 1-{} characters",
            MAX_TOKEN_LEN
        )));
    }
    if let Some(bad) = token
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-')))
    {
        return Err(FleetError::InvalidRequest(format!(
            "version token '{}' contains unsupported character '{}'",
            token.escape_debug(),
            bad.escape_debug()
        )));
    }
    Ok(())
}

/// POSIX single-quote `value`
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Rebuild `public_key` as a managed line: key type, blob and version marker.
/// Any comment on the input is dropped.
pub fn authorized_key_line(public_key: &str, version: &VersionId) -> Result<String, FleetError> {
    validate_token(version)?;

    let mut fields = public_key.split_whitespace();
    let (key_type, blob) = match (fields.next(), fields.next()) {
        (Some(key_type), Some(blob)) => (key_type, blob),
        _ => {
            return Err(FleetError::InvalidRequest(
                "public key must be '<type> <base64> [comment]'".to_string(),
            ))
        }
    };

    let type_ok = key_type
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '@' | '.'));
    let blob_ok = blob
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='));
    if !type_ok || !blob_ok {
        return Err(FleetError::InvalidRequest(
            "public key contains unexpected characters".to_string(),
        ));
    }

    Ok(format!("{} {} {}", key_type, blob, version_tag(version.as_str())))
}

fn target_file(authorized_keys_path: Option<&str>) -> String {
    match authorized_keys_path {
        Some(path) => shell_quote(path),
        None => DEFAULT_AUTHORIZED_KEYS.to_string(),
    }
}

pub fn add_key_script(authorized_keys_path: Option<&str>, line: &str) -> String {
    let quoted = shell_quote(line);
    format!(
        "set -e; umask 077; f={file}; mkdir -p \"$(dirname \"$f\")\"; touch \"$f\"; \
         grep -qxF {line} \"$f\" || printf '%s\\n' {line} >> \"$f\"",
        file = target_file(authorized_keys_path),
        line = quoted,
    )
}

pub fn remove_key_script(authorized_keys_path: Option<&str>, version: &VersionId) -> Result<String, FleetError> {
    validate_token(version)?;
    let pattern = format!(" {}$", version_tag(version.as_str())).replace('.', "\\.");
    Ok(format!(
        "set -e; f={file}; [ -f \"$f\" ] || exit 0; sed -i {expr} \"$f\"",
        file = target_file(authorized_keys_path),
        expr = shell_quote(&format!("/{}/d", pattern)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAaaaa generated";
    const KEY_B: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBbbbb";

    #[test]
    fn test_token_charset() {
        assert!(validate_token(&VersionId::new("6f1e2c3a-0b4d-4e5f-8a9b-1c2d3e4f5a6b")).is_ok());
        assert!(validate_token(&VersionId::new("v1.2:beta_3")).is_ok());
        assert!(validate_token(&VersionId::new("")).is_err());
        assert!(validate_token(&VersionId::new("t1; rm -rf /")).is_err());
        assert!(validate_token(&VersionId::new("t'1")).is_err());
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_line_replaces_comment_with_version_marker() {
        let line = authorized_key_line(KEY_A, &VersionId::new("t1")).unwrap();
        assert_eq!(
            line,
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAaaaa sshrotate-version=t1"
        );
        assert!(authorized_key_line("ssh-ed25519", &VersionId::new("t1")).is_err());
        assert!(authorized_key_line("ssh-ed25519 AAA$(id)", &VersionId::new("t1")).is_err());
    }

    #[cfg(unix)]
    fn run(script: &str) {
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .status()
            .unwrap();
        assert!(status.success(), "script failed: {}", script);
    }

    #[cfg(unix)]
    #[test]
    fn test_scripts_are_idempotent_on_a_real_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ssh").join("authorized_keys");
        let path_str = path.display().to_string();

        let t1 = VersionId::new("t.1");
        let t11 = VersionId::new("t-11");
        let line_1 = authorized_key_line(KEY_A, &t1).unwrap();
        let line_11 = authorized_key_line(KEY_B, &t11).unwrap();

        run(&add_key_script(Some(&path_str), &line_1));
        run(&add_key_script(Some(&path_str), &line_1));
        run(&add_key_script(Some(&path_str), &line_11));

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().filter(|l| *l == line_1).count(), 1);
        assert_eq!(contents.lines().count(), 2);

        let remove = remove_key_script(Some(&path_str), &t1).unwrap();
        run(&remove);
        run(&remove);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().collect::<Vec<_>>(), vec![line_11.as_str()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_remove_on_missing_file_succeeds() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("absent");
        run(&remove_key_script(Some(&path.display().to_string()), &VersionId::new("t1")).unwrap());
        assert!(!path.exists());
    }
}
