//! End-to-end runs of the `bfs` binary over scratch directory trees.

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::Path;
use std::process::{Command, Output};

fn bfs(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_bfs"))
        .args(args)
        .current_dir(dir)
        .output()
        .expect("the binary should run")
}

fn stdout_lines(output: &Output) -> BTreeSet<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect()
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn filters_by_name_patterns() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("a")).unwrap();
    fs::write(dir.path().join("a/x.txt"), b"").unwrap();
    fs::write(dir.path().join("a/y.md"), b"").unwrap();
    fs::write(dir.path().join("a/z.log"), b"").unwrap();

    let output = bfs(
        dir.path(),
        &["a", "-name", "*.txt", "-or", "-name", "*.md"],
    );
    assert!(output.status.success());
    assert_eq!(stdout_lines(&output), set(&["a/x.txt", "a/y.md"]));
}

#[test]
fn maxdepth_cuts_the_walk_short() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("a/b")).unwrap();

    let output = bfs(dir.path(), &["-maxdepth", "1", "."]);
    assert!(output.status.success());
    assert_eq!(stdout_lines(&output), set(&[".", "./a"]));
}

#[test]
fn delete_removes_empty_directories_bottom_up() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("a/b")).unwrap();

    let output = bfs(
        dir.path(),
        &[".", "-depth", "-type", "d", "-empty", "-delete"],
    );
    // Deleting `.` itself is refused, which is reported but leaves the
    // rest of the work done.
    assert!(!dir.path().join("a").exists());
    assert!(dir.path().exists());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("refusing"), "stderr was: {stderr}");
}

#[test]
fn o1_folds_constants_into_true() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("file"), b"").unwrap();

    let output = bfs(
        dir.path(),
        &["-O1", "-not", "(", "-true", "-and", "-false", ")"],
    );
    assert!(output.status.success());
    assert_eq!(stdout_lines(&output), set(&[".", "./file"]));
}

#[test]
fn typos_get_a_suggestion_and_exit_code_two() {
    let dir = tempfile::tempdir().unwrap();
    let output = bfs(dir.path(), &["-xtpye", "f"]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("-xtype"), "stderr was: {stderr}");
}

#[test]
fn optimizer_levels_agree_on_pure_expressions() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("src/deep")).unwrap();
    fs::write(dir.path().join("src/main.rs"), b"fn main() {}").unwrap();
    fs::write(dir.path().join("src/deep/util.rs"), b"").unwrap();
    fs::write(dir.path().join("README.md"), b"# hi").unwrap();

    let expr = [
        ".",
        "(",
        "-name",
        "*.rs",
        "-o",
        "-type",
        "d",
        ")",
        "-a",
        "!",
        "-name",
        "deep",
    ];
    let mut results = Vec::new();
    for level in ["-O0", "-O1", "-O2", "-O3"] {
        let mut args = vec![level];
        args.extend_from_slice(&expr);
        let output = bfs(dir.path(), &args);
        assert!(output.status.success());
        results.push(stdout_lines(&output));
    }
    for window in results.windows(2) {
        assert_eq!(window[0], window[1]);
    }
    assert!(results[0].contains("./src/main.rs"));
    assert!(!results[0].contains("./src/deep"));
}

#[test]
fn type_and_size_tests_compose() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("d")).unwrap();
    fs::write(dir.path().join("small"), b"ab").unwrap();
    fs::write(dir.path().join("large"), vec![0u8; 2048]).unwrap();

    let output = bfs(dir.path(), &[".", "-type", "f", "-size", "+1k"]);
    assert_eq!(stdout_lines(&output), set(&["./large"]));

    let output = bfs(dir.path(), &[".", "-type", "d"]);
    assert_eq!(stdout_lines(&output), set(&[".", "./d"]));
}

#[test]
fn empty_test_sees_files_and_directories() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("hollow")).unwrap();
    fs::create_dir(dir.path().join("full")).unwrap();
    fs::write(dir.path().join("full/data"), b"x").unwrap();
    fs::write(dir.path().join("blank"), b"").unwrap();

    let output = bfs(dir.path(), &[".", "-empty"]);
    assert_eq!(stdout_lines(&output), set(&["./hollow", "./blank"]));
}

#[test]
fn perm_checks_match_chmod_spellings() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("file");
    fs::write(&file, b"x").unwrap();
    fs::set_permissions(&file, fs::Permissions::from_mode(0o644)).unwrap();

    let hits = |args: &[&str]| stdout_lines(&bfs(dir.path(), args));
    assert!(hits(&[".", "-perm", "644"]).contains("./file"));
    assert!(hits(&[".", "-perm", "-644"]).contains("./file"));
    assert!(hits(&[".", "-perm", "/222"]).contains("./file"));
    assert!(!hits(&[".", "-perm", "755"]).contains("./file"));
    assert!(hits(&[".", "-perm", "-u+rw"]).contains("./file"));
    assert!(!hits(&[".", "-perm", "-u+rwx"]).contains("./file"));
}

#[test]
fn print0_terminates_with_nul() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("one"), b"").unwrap();

    let output = bfs(dir.path(), &[".", "-name", "one", "-print0"]);
    assert_eq!(output.stdout, b"./one\0");
}

#[test]
fn printf_renders_directives() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("data"), b"12345").unwrap();

    let output = bfs(
        dir.path(),
        &[".", "-name", "data", "-printf", "%f %s %y\\n"],
    );
    assert_eq!(String::from_utf8_lossy(&output.stdout), "data 5 f\n");
}

#[test]
fn fprint_writes_to_a_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("hit"), b"").unwrap();
    let out = dir.path().join("out.txt");

    let output = bfs(
        dir.path(),
        &[".", "-name", "hit", "-fprint", out.to_str().unwrap()],
    );
    assert!(output.status.success());
    assert_eq!(fs::read_to_string(&out).unwrap(), "./hit\n");
}

#[test]
fn exec_substitutes_the_path() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("f1"), b"payload").unwrap();

    let output = bfs(
        dir.path(),
        &[".", "-name", "f1", "-exec", "cat", "{}", ";"],
    );
    assert!(output.status.success());
    assert_eq!(output.stdout, b"payload");
}

#[test]
fn exec_batches_with_plus() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["m1", "m2", "m3"] {
        fs::write(dir.path().join(name), b"").unwrap();
    }
    let output = bfs(
        dir.path(),
        &[".", "-type", "f", "-exec", "echo", "{}", "+"],
    );
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    // One invocation with all three paths.
    assert_eq!(stdout.lines().count(), 1);
    for name in ["./m1", "./m2", "./m3"] {
        assert!(stdout.contains(name), "missing {name} in {stdout}");
    }
}

#[test]
fn follow_flag_descends_symlinked_directories() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("real")).unwrap();
    fs::write(dir.path().join("real/inner"), b"").unwrap();
    symlink(dir.path().join("real"), dir.path().join("sym")).unwrap();

    let without = stdout_lines(&bfs(dir.path(), &["."]));
    assert!(!without.contains("./sym/inner"));

    let with = stdout_lines(&bfs(dir.path(), &["-L", "."]));
    assert!(with.contains("./sym/inner"));

    // Under -L, -type l only matches dangling links.
    let types = stdout_lines(&bfs(dir.path(), &["-L", ".", "-type", "l"]));
    assert!(types.is_empty());
}

#[test]
fn prune_stops_descent_but_not_siblings() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("skip/deep")).unwrap();
    fs::create_dir(dir.path().join("keep")).unwrap();
    fs::write(dir.path().join("keep/file"), b"").unwrap();

    let output = bfs(
        dir.path(),
        &[".", "-name", "skip", "-prune", "-o", "-print"],
    );
    let lines = stdout_lines(&output);
    assert!(lines.contains("./keep/file"));
    assert!(!lines.contains("./skip/deep"));
    assert!(!lines.contains("./skip"));
}

#[test]
fn quit_stops_after_the_first_match() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("a/b/c")).unwrap();

    let output = bfs(dir.path(), &[".", "-print", "-quit"]);
    assert!(output.status.success());
    assert_eq!(stdout_lines(&output), set(&["."]));
}

#[test]
fn exit_action_sets_the_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let output = bfs(dir.path(), &[".", "-exit", "7"]);
    assert_eq!(output.status.code(), Some(7));
}

#[test]
fn missing_roots_report_and_fail() {
    let dir = tempfile::tempdir().unwrap();
    let output = bfs(dir.path(), &["no-such-root"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no-such-root"), "stderr was: {stderr}");
}

#[test]
fn mindepth_and_depth_order_compose() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("a/b")).unwrap();

    let output = bfs(dir.path(), &[".", "-mindepth", "1"]);
    let lines = stdout_lines(&output);
    assert!(!lines.contains("."));
    assert!(lines.contains("./a"));
    assert!(lines.contains("./a/b"));

    // Post-order prints children before their directories.
    let output = bfs(dir.path(), &[".", "-depth"]);
    let ordered: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect();
    let position = |needle: &str| ordered.iter().position(|l| l == needle).unwrap();
    assert!(position("./a/b") < position("./a"));
    assert!(position("./a") < position("."));
}

#[test]
fn search_strategies_cover_the_same_entries() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("x/y")).unwrap();
    fs::write(dir.path().join("x/f"), b"").unwrap();

    let baseline = stdout_lines(&bfs(dir.path(), &["."]));
    for strategy in ["dfs", "ids", "eds"] {
        let output = bfs(dir.path(), &["-S", strategy, "."]);
        assert!(output.status.success(), "-S {strategy} failed");
        assert_eq!(
            stdout_lines(&output),
            baseline,
            "-S {strategy} diverged"
        );
    }
}

#[test]
fn comma_evaluates_both_sides() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("f"), b"").unwrap();

    let out = dir.path().join("log");
    let output = bfs(
        dir.path(),
        &[
            ".",
            "-name",
            "f",
            "-fprint",
            out.to_str().unwrap(),
            ",",
            "-name",
            "f",
            "-print",
        ],
    );
    assert!(output.status.success());
    assert_eq!(stdout_lines(&output), set(&["./f"]));
    assert_eq!(fs::read_to_string(&out).unwrap(), "./f\n");
}
