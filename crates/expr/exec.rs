//! Child processes for the `-exec` family.

use std::ffi::{OsStr, OsString};
use std::io::{self, BufRead, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

/// Flush a `+` batch before its argument list grows past this.
const BATCH_BYTES_MAX: usize = 1 << 20;

/// A parsed `-exec`/`-execdir`/`-ok`/`-okdir` clause.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    /// Command template; `{}` expands to the current path.
    pub argv: Vec<OsString>,
    /// Run from the entry's parent directory with a `./name` argument.
    pub in_dir: bool,
    /// Prompt on stderr before running.
    pub confirm: bool,
    /// `+` form: batch paths onto one invocation.
    pub batch: bool,
}

/// Mutable run state for one exec clause.
pub struct ExecState {
    spec: ExecSpec,
    pending: Vec<OsString>,
    pending_bytes: usize,
    /// Directory the pending batch belongs to, for `-execdir ... +`.
    pending_dir: Option<PathBuf>,
    /// A batched invocation failed at some point.
    pub failed: bool,
}

impl ExecState {
    pub fn new(spec: ExecSpec) -> Self {
        Self {
            spec,
            pending: Vec::new(),
            pending_bytes: 0,
            pending_dir: None,
            failed: false,
        }
    }

    /// Evaluate the clause for one entry. For `;` clauses the result is the
    /// child's success; `+` clauses accumulate and always hold true.
    pub fn run(&mut self, path: &Path, name_off: usize) -> io::Result<bool> {
        let (workdir, path_arg) = if self.spec.in_dir {
            let bytes = path.as_os_str().as_bytes();
            let mut arg = OsString::from("./");
            arg.push(OsStr::from_bytes(&bytes[name_off..]));
            (Some(parent_of(path)), arg)
        } else {
            (None, path.as_os_str().to_os_string())
        };

        if self.spec.batch {
            if self.pending_dir.as_deref() != workdir.as_deref() && !self.pending.is_empty() {
                self.flush()?;
            }
            self.pending_dir = workdir;
            self.pending_bytes += path_arg.len() + 1;
            self.pending.push(path_arg);
            if self.pending_bytes >= BATCH_BYTES_MAX {
                self.flush()?;
            }
            return Ok(true);
        }

        let argv: Vec<OsString> = self
            .spec
            .argv
            .iter()
            .map(|arg| replace_braces(arg, &path_arg))
            .collect();
        if self.spec.confirm && !prompt(&argv)? {
            return Ok(false);
        }
        run_command(&argv, workdir.as_deref())
    }

    /// Run whatever is still batched. Called once the traversal ends.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        // The template ends with the placeholder; paths go in its place.
        let mut argv: Vec<OsString> = self.spec.argv[..self.spec.argv.len() - 1].to_vec();
        argv.append(&mut self.pending);
        self.pending_bytes = 0;
        let workdir = self.pending_dir.take();
        match run_command(&argv, workdir.as_deref()) {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.failed = true;
                Ok(())
            }
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }
}

fn parent_of(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Substitute every occurrence of `{}` within one argument.
fn replace_braces(arg: &OsStr, path: &OsStr) -> OsString {
    let bytes = arg.as_bytes();
    if !bytes.windows(2).any(|w| w == b"{}") {
        return arg.to_os_string();
    }
    let mut out = Vec::with_capacity(bytes.len() + path.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i..].starts_with(b"{}") {
            out.extend_from_slice(path.as_bytes());
            i += 2;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    OsString::from_vec(out)
}

fn prompt(argv: &[OsString]) -> io::Result<bool> {
    let rendered: Vec<String> = argv
        .iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    eprint!("< {} > ? ", rendered.join(" "));
    io::stderr().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim_start().starts_with(['y', 'Y']))
}

fn run_command(argv: &[OsString], workdir: Option<&Path>) -> io::Result<bool> {
    let Some((program, args)) = argv.split_first() else {
        return Ok(false);
    };
    debug!(target: "exec", "spawning {argv:?}");
    let mut command = Command::new(program);
    command.args(args);
    if let Some(dir) = workdir {
        command.current_dir(dir);
    }
    let status = command.status()?;
    Ok(status.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn braces_substitute_anywhere_in_an_argument() {
        let path = OsStr::new("a/b");
        assert_eq!(replace_braces(OsStr::new("{}"), path), "a/b");
        assert_eq!(replace_braces(OsStr::new("x{}y"), path), "xa/by");
        assert_eq!(replace_braces(OsStr::new("{}{}"), path), "a/ba/b");
        assert_eq!(replace_braces(OsStr::new("plain"), path), "plain");
    }

    #[test]
    fn child_exit_status_becomes_the_result() {
        let mut ok = ExecState::new(ExecSpec {
            argv: vec!["true".into(), "{}".into()],
            in_dir: false,
            confirm: false,
            batch: false,
        });
        assert!(ok.run(Path::new("/"), 1).unwrap());

        let mut bad = ExecState::new(ExecSpec {
            argv: vec!["false".into()],
            in_dir: false,
            confirm: false,
            batch: false,
        });
        assert!(!bad.run(Path::new("/"), 1).unwrap());
    }

    #[test]
    fn batches_accumulate_until_flush() {
        let mut state = ExecState::new(ExecSpec {
            argv: vec!["true".into(), "{}".into()],
            in_dir: false,
            confirm: false,
            batch: true,
        });
        for i in 0..10 {
            let path = format!("/tmp/file{i}");
            assert!(state.run(Path::new(&path), 5).unwrap());
        }
        assert_eq!(state.pending.len(), 10);
        state.flush().unwrap();
        assert!(state.pending.is_empty());
        assert!(!state.failed);
    }

    #[test]
    fn missing_binary_is_an_error() {
        let mut state = ExecState::new(ExecSpec {
            argv: vec!["/no/such/binary".into()],
            in_dir: false,
            confirm: false,
            batch: false,
        });
        assert!(state.run(Path::new("/x"), 1).is_err());
    }
}
