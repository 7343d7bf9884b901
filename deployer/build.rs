//! Build script for botdeploy
//! Stamps the binary with the commit and build time reported by `--version`

use chrono::Utc;
use std::env;
use std::process::Command;

fn main() {
    // Release pipelines build from tarballs without a .git directory
    let git_hash = env::var("BOTDEPLOY_GIT_HASH").ok().filter(|h| !h.is_empty()).unwrap_or_else(|| {
        Command::new("git")
            .args(["rev-parse", "--short", "HEAD"])
            .output()
            .ok()
            .filter(|output| output.status.success())
            .and_then(|output| String::from_utf8(output.stdout).ok())
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    });

    let build_time = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();

    println!("cargo:rustc-env=GIT_HASH={}", git_hash);
    println!("cargo:rustc-env=BUILD_TIME={}", build_time);

    println!("cargo:rerun-if-env-changed=BOTDEPLOY_GIT_HASH");
    println!("cargo:rerun-if-changed=.git/HEAD");
}
