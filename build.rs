use std::process::Command;

/// Short commit hash of the working tree, with a `-dirty` marker when
/// local modifications exist, so a running gateway can always be traced
/// back to exact sources. `None` outside a git checkout.
fn git_revision() -> Option<String> {
    let out = Command::new("git")
        .args(["rev-parse", "--short=12", "HEAD"])
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let hash = String::from_utf8(out.stdout).ok()?;
    let hash = hash.trim();
    if hash.is_empty() {
        return None;
    }

    let dirty = Command::new("git")
        .args(["status", "--porcelain"])
        .output()
        .map(|o| o.status.success() && !o.stdout.is_empty())
        .unwrap_or(false);

    Some(if dirty {
        format!("{}-dirty", hash)
    } else {
        hash.to_string()
    })
}

fn main() {
    println!(
        "cargo:rustc-env=BUILD_DATE={}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "cargo:rustc-env=GIT_HASH={}",
        git_revision().unwrap_or_else(|| "unknown".to_string())
    );
    // target triple, reported by `darvazeh version` next to the hash
    println!(
        "cargo:rustc-env=BUILD_TARGET={}",
        std::env::var("TARGET").unwrap_or_default()
    );

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
}
