//! Defines the command-line surface through clap types.

use std::env;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;

use crate::api::{Api, HttpBackend};
use crate::fs::EngineOptions;
use crate::mount;

/// Command line options, defined using the clap crate.
#[derive(Debug, Parser)]
#[clap(name = "cgfs", version, about = "Mount a CodeGrade review platform as a filesystem")]
pub struct Options {
    /// Your username on the review platform.
    #[clap(value_name = "USERNAME")]
    pub username: String,

    /// The directory to mount the filesystem in.
    #[clap(value_name = "MOUNTPOINT")]
    pub mountpoint: PathBuf,

    /// Your password. Falls back to the CGFS_PASSWORD environment
    /// variable, then to a prompt.
    #[clap(short, long)]
    pub password: Option<String>,

    /// Base URL of the API. Falls back to the CGAPI_BASE_URL environment
    /// variable, then to the public instance.
    #[clap(short, long)]
    pub url: Option<String>,

    /// Sets verbosity level. Can be specified multiple times.
    #[clap(long("verbose"), short, action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Only output warnings and errors.
    #[clap(short, long)]
    pub quiet: bool,

    /// Show all submissions, not only the newest per student.
    #[clap(short, long = "all-submissions")]
    pub all_submissions: bool,

    /// Mount server files read-only; new files go to local scratch
    /// storage that vanishes at unmount.
    #[clap(short, long)]
    pub fixed: bool,

    /// Allow deleting rubric rows and items through .cg-edit-rubric.md.
    #[clap(short, long = "rubric-edit")]
    pub rubric_edit: bool,

    /// Only show submissions assigned to you, where assignees are used.
    #[clap(short = 'm', long = "assigned-to-me")]
    pub assigned_to_me: bool,
}

impl Options {
    pub fn run(self) -> anyhow::Result<()> {
        let password = resolve_password(self.password.as_deref())?;
        let url = self
            .url
            .clone()
            .or_else(|| env::var("CGAPI_BASE_URL").ok());

        let backend =
            HttpBackend::login(url.as_deref(), &self.username, &password, self.fixed)
                .context("logging in failed")?;
        let api = Api::new(backend);

        let mountpoint = resolve_path(&self.mountpoint);
        let options = EngineOptions {
            fixed: self.fixed,
            latest_only: !self.all_submissions,
            assigned_only: self.assigned_to_me,
            rubric_append_only: !self.rubric_edit,
        };

        mount::create_and_mount(api, &mountpoint, options)
    }
}

pub fn resolve_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

fn resolve_password(arg: Option<&str>) -> anyhow::Result<String> {
    if let Some(password) = arg {
        return Ok(password.to_owned());
    }
    if let Ok(password) = env::var("CGFS_PASSWORD") {
        return Ok(password);
    }

    let stdin = io::stdin();
    if stdin.is_terminal() {
        prompt_password().context("failed to read the password from the terminal")
    } else {
        let mut line = String::new();
        stdin
            .lock()
            .read_line(&mut line)
            .context("failed to read the password from stdin")?;
        Ok(line.trim_end_matches(['\r', '\n']).to_owned())
    }
}

/// Reads a line from the controlling terminal with echo turned off.
#[cfg(unix)]
fn prompt_password() -> io::Result<String> {
    eprint!("Password: ");
    io::stderr().flush()?;

    let fd = libc::STDIN_FILENO;
    let mut term = unsafe { std::mem::zeroed::<libc::termios>() };
    if unsafe { libc::tcgetattr(fd, &mut term) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let original = term;
    term.c_lflag &= !libc::ECHO;
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &term) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut line = String::new();
    let result = io::stdin().lock().read_line(&mut line);

    unsafe { libc::tcsetattr(fd, libc::TCSANOW, &original) };
    eprintln!();

    result?;
    Ok(line.trim_end_matches(['\r', '\n']).to_owned())
}

#[cfg(not(unix))]
fn prompt_password() -> io::Result<String> {
    eprint!("Password: ");
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_owned())
}
