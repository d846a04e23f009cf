//! Command setup shared by the server process and the maintenance scripts.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

/// A command for one of the keeper's children: `stdin` as given, stdout and
/// stderr piped so the caller can capture them, and no console window of its
/// own on Windows.
pub fn captured_command(program: &Path, stdin: Stdio) -> Command {
    let mut cmd = Command::new(program);
    cmd.stdin(stdin).stdout(Stdio::piped()).stderr(Stdio::piped());
    hide_console_window(&mut cmd);
    cmd
}

#[cfg(target_os = "windows")]
fn hide_console_window(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(target_os = "windows"))]
fn hide_console_window(_cmd: &mut Command) {}
