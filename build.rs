//! Stamps the relay's `--version` output

use std::process::Command;

/// Trimmed stdout of a successful git invocation
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn main() {
    let version = git(&["describe", "--tags", "--abbrev=0"])
        .unwrap_or_else(|| format!("v{}", env!("CARGO_PKG_VERSION")));
    let commit = git(&["rev-parse", "--short=10", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
    let dirty = git(&["status", "--porcelain", "--untracked-files=no"]).is_some();

    println!("cargo:rustc-env=WORMHOLE_VERSION={}", version);
    println!(
        "cargo:rustc-env=WORMHOLE_COMMIT={}{}",
        commit,
        if dirty { "-dirty" } else { "" }
    );
    println!(
        "cargo:rustc-env=WORMHOLE_BUILT={}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M UTC")
    );

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
}
