//! Build identity of the running agent: version, commit, snapshot flag,
//! and the artifact verification key baked in at build time.

/// Short-hash length used for install directory names.
pub const HASH_LEN: usize = 6;

/// Ed25519 public key (base64) used to verify upgrade artifacts.
/// Overridden at build time for official releases via `WARDEN_VERIFY_KEY`.
pub const VERIFY_KEY_B64: &str = match option_env!("WARDEN_VERIFY_KEY") {
    Some(k) => k,
    None => "",
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Commit this binary was built from. `WARDEN_COMMIT_OVERRIDE` exists for
/// tests that need to impersonate a given install.
pub fn commit() -> String {
    if let Ok(c) = std::env::var("WARDEN_COMMIT_OVERRIDE") {
        if !c.is_empty() {
            return c;
        }
    }
    option_env!("WARDEN_COMMIT").unwrap_or("unknown").to_string()
}

pub fn short_commit() -> String {
    trim_commit(&commit())
}

pub fn trim_commit(hash: &str) -> String {
    hash.chars().take(HASH_LEN).collect()
}

/// Snapshot builds prefer the snapshot artifact repository.
pub fn snapshot() -> bool {
    std::env::var("WARDEN_SNAPSHOT")
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or_else(|_| version().ends_with("-SNAPSHOT"))
}

/// Whether unsigned artifacts may be accepted. Only honored when no
/// verification key was baked in, i.e. development builds.
pub fn allow_unverified() -> (bool, String) {
    let allow = VERIFY_KEY_B64.is_empty()
        && std::env::var("WARDEN_ALLOW_UNVERIFIED")
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);
    (allow, VERIFY_KEY_B64.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_commit_is_bounded() {
        assert_eq!(trim_commit("abcdef123456"), "abcdef");
        assert_eq!(trim_commit("ab"), "ab");
    }
}
