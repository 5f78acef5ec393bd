use std::{
    fs,
    process::{Command, Stdio},
    thread,
};

use anyhow::Context;
use camino::Utf8PathBuf;
use cargo_metadata::Message;
use clap::Parser;

#[derive(Parser, Clone, Copy)]
enum Action {
    #[command(about = "Build hook dlls and hook hosts for both architectures")]
    BuildHooks,
}

fn main() -> anyhow::Result<()> {
    match Action::parse() {
        Action::BuildHooks => build_hooks()?,
    }

    Ok(())
}

/// The watchdog and hook hosts look artifacts up by fixed bitness-suffixed
/// names, so the copies here must match what they expect.
fn build_hooks() -> anyhow::Result<()> {
    let tasks = thread::scope(|scope| {
        let dll64 = scope.spawn(|| cargo_artifacts("winweave-hook", "x86_64-pc-windows-msvc"));
        let dll32 = scope.spawn(|| cargo_artifacts("winweave-hook", "i686-pc-windows-msvc"));
        let host64 =
            scope.spawn(|| cargo_artifacts("winweave-hook-host", "x86_64-pc-windows-msvc"));
        let host32 = scope.spawn(|| cargo_artifacts("winweave-hook-host", "i686-pc-windows-msvc"));

        (dll64.join(), dll32.join(), host64.join(), host32.join())
    });

    let dll64 = tasks
        .0
        .expect("x86_64 dll build failed")
        .context("x86_64 dll build has no output")?;
    let dll32 = tasks
        .1
        .expect("i686 dll build failed")
        .context("i686 dll build has no output")?;
    let host64 = tasks
        .2
        .expect("x86_64 host build failed")
        .context("x86_64 host build has no output")?;
    let host32 = tasks
        .3
        .expect("i686 host build failed")
        .context("i686 host build has no output")?;

    fs::copy(dll64, "./winweave-hook64.dll")?;
    fs::copy(dll32, "./winweave-hook32.dll")?;
    fs::copy(host64, "./winweave-hook-host64.exe")?;
    fs::copy(host32, "./winweave-hook-host32.exe")?;

    Ok(())
}

fn cargo_artifacts(project: &str, target: &str) -> Option<Utf8PathBuf> {
    let mut command = Command::new("cargo")
        .args([
            "build",
            "--release",
            "-p",
            project,
            "--message-format=json-render-diagnostics",
            &format!("--target={target}"),
        ])
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();

    let mut exe = None;

    let target_name = project.replace("-", "_");

    let reader = std::io::BufReader::new(command.stdout.take().unwrap());
    for message in cargo_metadata::Message::parse_stream(reader) {
        if let Message::CompilerArtifact(artifact) = message.unwrap() {
            if artifact.target.name.replace("-", "_") != target_name {
                continue;
            }

            if exe.is_none() {
                exe = artifact.filenames.first().cloned();
            }
        }
    }
    command.wait().expect("cargo process exited unexpectedly");

    exe
}
