mod raw {
    // Constants generated by the `built` crate from build.rs.
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// Crate version such as 0.3.0
pub const PKG_VERSION: &str = raw::PKG_VERSION;

/// Comma separated features enabled for this build
pub const FEATURES: &str = raw::FEATURES_STR;

lazy_static! {
    /// Git version such as a96e8f99, a96e8f99-dirty, or unknown-git-version
    /// if quiesce is not built from a git repo.
    pub static ref GIT_VERSION: &'static str = &GIT_VERSION_STRING;

    // Owned string
    static ref GIT_VERSION_STRING: String = match (raw::GIT_COMMIT_HASH, raw::GIT_DIRTY) {
        (Some(hash), dirty) => format!(
            "{}{}",
            hash,
            if dirty == Some(true) { "-dirty" } else { "" }
        ),
        _ => "unknown-git-version".to_string(),
    };
}
