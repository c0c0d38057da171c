//! RSA host-key fingerprints
//!
//! Two sources produce comparable values: the provider's serial console
//! prints an MD5 colon-hex fingerprint between fixed marker lines, and a
//! live key scan yields a known-hosts line whose key blob we digest
//! ourselves. Both normalize to the same `aa:bb:...` form.

use base64::Engine;
use md5::{Digest, Md5};

/// Marker line the provider prints before host-key fingerprints
pub const CONSOLE_MARKER: &str = "BEGIN SSH HOST KEY FINGERPRINTS";

const RSA_KEY_PATH: &str = "/etc/ssh/ssh_host_rsa_key.pub";

/// Extract the RSA host-key fingerprint from serial console output.
///
/// Looks for the marker section, then for the line naming the RSA host key,
/// and returns the colon-hex token on that line. `None` when the console
/// has not produced the section yet.
pub fn console_rsa_fingerprint(console: &str) -> Option<String> {
    let (_, tail) = console.split_once(CONSOLE_MARKER)?;
    tail.lines()
        .find(|line| line.contains(RSA_KEY_PATH))
        .and_then(|line| {
            line.split_whitespace()
                .find(|token| is_md5_fingerprint(token))
                .map(str::to_string)
        })
}

/// 16 colon-separated lowercase hex pairs
fn is_md5_fingerprint(token: &str) -> bool {
    let parts: Vec<&str> = token.split(':').collect();
    parts.len() == 16
        && parts.iter().all(|p| {
            p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        })
}

/// MD5 colon-hex fingerprint of the key blob in a keyscan output line
/// (`host key-type base64-blob`). `None` for comments and malformed lines.
pub fn keyscan_line_fingerprint(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut fields = line.split_whitespace();
    let _host = fields.next()?;
    let _key_type = fields.next()?;
    let blob = fields.next()?;
    let raw = base64::engine::general_purpose::STANDARD.decode(blob).ok()?;

    let digest = Md5::digest(&raw);
    let fingerprint = digest
        .iter()
        .map(|byte| hex::encode([*byte]))
        .collect::<Vec<_>>()
        .join(":");
    Some(fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONSOLE_SAMPLE: &str = "\
cloud-init boot messages...
ec2: -----BEGIN SSH HOST KEY FINGERPRINTS-----
ec2: 1024 aa:11:22:33:44:55:66:77:88:99:aa:bb:cc:dd:ee:ff /etc/ssh/ssh_host_dsa_key.pub (DSA)
ec2: 2048 7a:e9:eb:41:b7:45:b1:07:30:ad:13:c5:a9:2a:a1:e5 /etc/ssh/ssh_host_rsa_key.pub (RSA)
ec2: -----END SSH HOST KEY FINGERPRINTS-----
more boot messages...";

    #[test]
    fn test_console_fingerprint_extraction() {
        assert_eq!(
            console_rsa_fingerprint(CONSOLE_SAMPLE).as_deref(),
            Some("7a:e9:eb:41:b7:45:b1:07:30:ad:13:c5:a9:2a:a1:e5")
        );
    }

    #[test]
    fn test_console_without_marker_yields_none() {
        assert_eq!(console_rsa_fingerprint("still booting..."), None);
    }

    #[test]
    fn test_console_marker_without_rsa_line_yields_none() {
        let partial = "ec2: -----BEGIN SSH HOST KEY FINGERPRINTS-----\n";
        assert_eq!(console_rsa_fingerprint(partial), None);
    }

    #[test]
    fn test_keyscan_fingerprint_shape() {
        // any valid base64 blob digests to a 16-pair colon-hex string
        let line = "host.example.org ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQC7";
        let fp = keyscan_line_fingerprint(line).unwrap();
        assert!(is_md5_fingerprint(&fp), "unexpected shape: {fp}");
    }

    #[test]
    fn test_keyscan_fingerprint_is_deterministic() {
        let line = "host ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQC7";
        assert_eq!(
            keyscan_line_fingerprint(line),
            keyscan_line_fingerprint("other-host ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQC7")
        );
    }

    #[test]
    fn test_keyscan_distinguishes_keys() {
        let a = keyscan_line_fingerprint("h ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQC7").unwrap();
        let b = keyscan_line_fingerprint("h ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQD8").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_keyscan_rejects_comments_and_garbage() {
        assert_eq!(keyscan_line_fingerprint("# host.example.org:22 SSH-2.0"), None);
        assert_eq!(keyscan_line_fingerprint(""), None);
        assert_eq!(keyscan_line_fingerprint("host ssh-rsa not!base64!"), None);
    }
}
