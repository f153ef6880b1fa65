//! Integration test: build and run real C programs with the host toolchain.
//!
//! Skipped (with a note on stderr) when no `cc` is installed.
//!
//! Run: cargo test -p examgrader-exec --test toolchain_test

use std::path::{Path, PathBuf};
use std::process::Command;

use examgrader_exec::{
    BuildRequest, BuildStatus, CancelToken, ExitStatus, RunLimits, Toolchain, run_binary,
};

fn have_cc() -> bool {
    Command::new("cc")
        .arg("--version")
        .output()
        .is_ok_and(|out| out.status.success())
}

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("examgrader-tc-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_source(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn builds_and_runs_a_program_with_raw_output() {
    if !have_cc() {
        eprintln!("skipping: cc not available");
        return;
    }
    let dir = scratch("ok");
    let sources = vec![write_source(
        &dir,
        "main.c",
        "#include <unistd.h>\nint main(void) { write(1, \"Weird\\0string\", 12); return 3; }\n",
    )];
    let toolchain = Toolchain::new(dir.join("build"));
    let artifact = toolchain
        .build(
            &BuildRequest {
                fixture_id: "nul/writer",
                compiler: "cc",
                flags: &[],
                sources: &sources,
                link_flags: &[],
            },
            &CancelToken::new(),
        )
        .unwrap();

    assert_eq!(artifact.status(), BuildStatus::Succeeded, "{}", artifact.diagnostics());
    let exe = artifact.executable().unwrap();
    assert!(exe.starts_with(toolchain.output_dir_for("nul/writer")));

    let run = run_binary(exe, &[] as &[&str], &RunLimits::default(), &CancelToken::new()).unwrap();
    assert_eq!(run.stdout, b"Weird\0string");
    assert_eq!(run.status, ExitStatus::Exited { code: 3 });

    artifact.cleanup().unwrap();
    assert!(!artifact.output_dir().exists());
}

#[test]
fn compile_error_keeps_toolchain_diagnostics() {
    if !have_cc() {
        eprintln!("skipping: cc not available");
        return;
    }
    let dir = scratch("err");
    let sources = vec![write_source(&dir, "broken.c", "int main(void) { return }\n")];
    let artifact = Toolchain::new(dir.join("build"))
        .build(
            &BuildRequest {
                fixture_id: "broken",
                compiler: "cc",
                flags: &[],
                sources: &sources,
                link_flags: &[],
            },
            &CancelToken::new(),
        )
        .unwrap();

    assert_eq!(artifact.status(), BuildStatus::Failed);
    assert!(artifact.executable().is_none());
    assert!(artifact.diagnostics().contains("broken.c"), "{}", artifact.diagnostics());
}

#[test]
fn missing_main_is_a_link_error() {
    if !have_cc() {
        eprintln!("skipping: cc not available");
        return;
    }
    let dir = scratch("nomain");
    let sources = vec![write_source(&dir, "hello.c", "void hello_world(void) {}\n")];
    let artifact = Toolchain::new(dir.join("build"))
        .build(
            &BuildRequest {
                fixture_id: "hello",
                compiler: "cc",
                flags: &[],
                sources: &sources,
                link_flags: &[],
            },
            &CancelToken::new(),
        )
        .unwrap();

    assert_eq!(artifact.status(), BuildStatus::Failed);
    assert!(!artifact.diagnostics().trim().is_empty());
}

#[test]
fn fingerprint_tracks_source_contents() {
    if !have_cc() {
        eprintln!("skipping: cc not available");
        return;
    }
    let dir = scratch("fp");
    let sources = vec![write_source(&dir, "main.c", "int main(void) { return 0; }\n")];
    let toolchain = Toolchain::new(dir.join("build"));
    let request = BuildRequest {
        fixture_id: "fp",
        compiler: "cc",
        flags: &[],
        sources: &sources,
        link_flags: &[],
    };

    let first = toolchain.build(&request, &CancelToken::new()).unwrap();
    let again = toolchain.build(&request, &CancelToken::new()).unwrap();
    assert_eq!(first.fingerprint(), again.fingerprint());

    write_source(&dir, "main.c", "int main(void) { return 1; }\n");
    let changed = toolchain.build(&request, &CancelToken::new()).unwrap();
    assert_ne!(first.fingerprint(), changed.fingerprint());
}
